pub mod execution;
pub mod pool;
