pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod operation;
pub mod percentile;
pub mod pool;
pub mod postgres;
pub mod router;
pub mod run;
pub mod stats;
pub mod task;

pub use aggregate::*;
pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use operation::*;
pub use percentile::*;
pub use pool::*;
pub use postgres::*;
pub use router::*;
pub use run::*;
pub use stats::*;
pub use task::*;
