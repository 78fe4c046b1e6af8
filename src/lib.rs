pub mod art;
pub mod config;
pub mod epoch;
pub mod error;
pub mod key;
pub mod nvm;
pub mod persist;

pub use art::{ChildKind, InsertOutcome, RemoveOutcome, Tree};
pub use key::Key;
pub use nvm::{close_nvm_mgr, get_nvm_mgr, init_nvm_mgr, NvmMgr};

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL_ALLOCATOR: MiMalloc = MiMalloc;

#[ctor::ctor]
fn init() {
    color_backtrace::install();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_file(true)
        .with_level(true)
        .without_time()
        .with_thread_ids(true)
        .init();
}
