//! `extern "C"` boundary over `threadrt-core`, in the shape of
//! `glibc-rs-abi`'s own veneer over its core crate: a thin translation layer
//! with no independent state of its own.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> Core impl (threadrt-core) -> return
//! ```
//!
//! Every symbol here is a direct call into `threadrt-core`, translating
//! argument/return shapes (pointers, `c_int` errno codes, C function
//! pointers) at the boundary and nothing more. There is no intermediate
//! membrane crate: `threadrt-core`'s public functions already validate their
//! own arguments and this crate's job stops at making them callable from C.
//!
//! Three modules, one per POSIX-adjacent surface:
//! - [`pthread_abi`]: thread lifecycle (`pthread_create`/`join`/.../`exit`).
//! - [`signal_abi`]: in-process signals, block/unblock, suspension, crash
//!   mode. Signal and mask handling here is *not* ABI-compatible with real
//!   `<signal.h>` (see that module's doc comment for why).
//! - [`block_abi`]: the block/unblock primitive and the cleanup stack, for
//!   callers that want them directly rather than through `pthread_abi`.

pub mod block_abi;
pub mod errno;
pub mod pthread_abi;
pub mod signal_abi;

pub use errno::to_errno;
