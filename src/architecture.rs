//! AArch64- and board-boot-specific mechanisms: the boot path, the exception
//! vectors and the registers behind them.

pub mod boot;
pub mod exception;
pub mod exception_handlers;
pub mod machine;
pub mod shutdown;

pub use shutdown::shutdown;
