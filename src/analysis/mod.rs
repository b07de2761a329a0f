//! Ownership analyses run before emission.
//!
//! [`schedule_destroys`] fills every scope's `destroys` table and
//! [`infer_destroy_classes`] narrows the function's destroy-class table.
//! Both only annotate the IR; neither changes its instructions.

pub mod destroy;
pub mod destroy_class;

pub use destroy::schedule_destroys;
pub use destroy_class::infer_destroy_classes;

use crate::core::CompileResult;
use crate::ir::Function;

/// Runs both analyses in the order the emitter expects.
pub fn analyze(func: &mut Function) -> CompileResult<()> {
    schedule_destroys(func)?;
    infer_destroy_classes(func)?;
    Ok(())
}
