//! # Redrive: durable back-office task scheduling in Rust
//!
//! Redrive executes back-office side-effects (order cancellation, payment
//! refunds and voids, webhooks) as durable tasks in a shared relational
//! store. Multiple replicas poll the store cooperatively, claim individual
//! tasks with conditional-update leases, dispatch them to type-specific
//! handlers, and drive each task through a bounded-retry lifecycle with
//! dead-lettering and webhook alerting on terminal failure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redrive::providers::sqlite::SqliteTaskStore;
//! use redrive::runtime::{HandlerRegistry, Runtime};
//! use redrive::alert::NoopAlerts;
//! use redrive::clients::{OrderServiceClient, PaymentServiceClient};
//! use redrive::config::{SchedulerOptions, ServiceClientOptions};
//! use redrive::handlers::{OrderCancelHandler, PaymentRefundHandler, PaymentVoidHandler};
//! use redrive::{CreateTaskRequest, NewTask, TaskType};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. A shared durable store
//! let store = Arc::new(SqliteTaskStore::new("sqlite:./tasks.db").await?);
//!
//! // 2. Handlers for the task types this deployment executes
//! let orders = Arc::new(OrderServiceClient::new(ServiceClientOptions::new(
//!     "https://orders.internal",
//! )));
//! let payments = Arc::new(PaymentServiceClient::new(ServiceClientOptions::new(
//!     "https://payments.internal",
//! )));
//! let registry = Arc::new(
//!     HandlerRegistry::builder()
//!         .register(Arc::new(OrderCancelHandler::new(orders)))
//!         .register(Arc::new(PaymentRefundHandler::new(payments.clone())))
//!         .register(Arc::new(PaymentVoidHandler::new(payments)))
//!         .build(),
//! );
//!
//! // 3. Start the replica
//! let rt = Runtime::start_with_store(
//!     store,
//!     registry,
//!     Arc::new(NoopAlerts),
//!     SchedulerOptions::default(),
//! )
//! .await;
//!
//! // 4. Create work through the management client
//! let client = rt.client();
//! let task = client
//!     .create_task(CreateTaskRequest::new(
//!         NewTask::new(TaskType::OrderCancel, "ORD-1001")
//!             .payload(serde_json::json!({"reason": "payment timeout"})),
//!     ))
//!     .await?;
//! println!("created {}", task.id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - **At-most-one concurrent attempt per task**: the conditional-update
//!   lease (version check + lock predicate) decides every claim.
//! - **At-least-one attempt up to the retry ceiling**: failed attempts
//!   re-enter the queue with handler-specific jittered backoff; handlers
//!   own downstream idempotency.
//! - **Crash recovery**: a replica that dies mid-attempt leaves an
//!   expiring lock; the stale-lock reaper resets the row with an
//!   operator-visible error.
//!
//! There is no workflow orchestration, no exactly-once external effect,
//! and no FIFO guarantee across priorities.

pub mod alert;
pub mod client;
pub mod clients;
pub mod config;
pub mod handlers;
pub mod providers;
pub mod runtime;
pub mod task;

pub use client::{Client, ClientError, CreateTaskRequest, DuplicatePolicy, TaskStatistics, TaskWithHistory};
pub use config::{AlertOptions, SchedulerOptions, ServiceClientOptions};
pub use handlers::{TaskExecutionResult, TaskHandler, ValidationError};
pub use providers::{StoreError, TaskQuery, TaskStore};
pub use runtime::{HandlerRegistry, MetricsSnapshot, Runtime};
pub use task::{
    ExecutionLog, NewTask, Task, TaskId, TaskPriority, TaskStatus, TaskType,
};
