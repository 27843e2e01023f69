//! AMD64 unwind info and the interpreter that replays or reverts a prolog.

mod state;
mod unwind_code;
mod unwind_info;
mod unwinder;
mod unwindregs;

pub use state::*;
pub use unwind_code::*;
pub use unwind_info::*;
pub use unwinder::*;
pub use unwindregs::*;
