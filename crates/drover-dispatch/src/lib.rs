//! drover-dispatch — work distribution and result aggregation rounds.
//!
//! A [`Dispatcher`] owns the coordinator endpoint for the duration of a
//! round: it hands each work item to whichever worker asks next, folds
//! results into a collection or reduction accumulator, and finishes when
//! the received count reaches the expected item count — the sole
//! termination condition. A round may also tend a borrowed
//! [`WorkerPool`](drover_pool::WorkerPool) on an interval, promoting
//! parked workers and recycling those near walltime expiry without
//! interrupting the exchange.

pub mod accumulate;
pub mod chunk;
pub mod dispatch;
pub mod error;

pub use accumulate::{Accumulate, Collected, FoldError, INDEX_FIELD, SumAccumulator};
pub use chunk::even_chunks;
pub use dispatch::{DispatchOptions, Dispatcher, ExhaustedPolicy, Maintenance};
pub use error::{DispatchError, DispatchResult};
