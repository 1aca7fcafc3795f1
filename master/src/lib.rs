//! Control loop de reconciliación para jobs batch.
//!
//! Cada job tiene tres modelos (referencia, running y store) y un engine
//! que, ciclo a ciclo, le pide al resolver las acciones que acercan running
//! y store a la referencia.

pub mod action;
pub mod actions;
pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod manager;
pub mod model;
pub mod resolver;
pub mod retryer;
pub mod services;
pub mod stubs;

pub use clock::{Clock, SystemClock, TestClock};
pub use config::JobManagerConfig;
pub use context::{CodeInvariants, JobManagerContext};
pub use error::{JobManagerError, Result};
pub use manager::JobManager;
pub use model::{Model, ModelViews};
