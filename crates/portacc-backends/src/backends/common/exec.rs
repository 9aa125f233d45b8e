//! Kernel execution helpers shared by the accelerators.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use portacc_core::IdxVec;

use super::block::{BarrierPoisoned, BlockContext};
use crate::error::{panic_message, BackendError, Result};

/// Run `body`, turning a panic into [`BackendError::KernelFailed`].
pub(crate) fn run_guarded(kernel: &str, acc: &str, body: impl FnOnce()) -> Result<()> {
    panic::catch_unwind(AssertUnwindSafe(body))
        .map_err(|payload| BackendError::kernel_failed(kernel, acc, panic_message(payload.as_ref())))
}

/// Run one block with one OS thread per block thread.
///
/// `body` receives the block-thread index. A panicking thread poisons the
/// block barrier so its siblings unwind instead of waiting forever; the
/// first real panic message is reported.
pub(crate) fn run_block_threads<const D: usize>(
    kernel: &str,
    acc: &str,
    block_thread_extent: IdxVec<D>,
    block: &Arc<BlockContext>,
    body: impl Fn(IdxVec<D>) + Sync,
) -> Result<()> {
    let threads = block_thread_extent.prod();
    if threads == 1 {
        return run_guarded(kernel, acc, || body(IdxVec::zeros()));
    }

    let first_panic: Mutex<Option<String>> = Mutex::new(None);
    let mut spawn_error = None;

    thread::scope(|scope| {
        for linear in 0..threads {
            let idx = IdxVec::delinearize(linear, &block_thread_extent);
            let body = &body;
            let first_panic = &first_panic;
            let spawned = thread::Builder::new()
                .name(format!("portacc-block-thread-{linear}"))
                .spawn_scoped(scope, move || {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(idx))) {
                        block.sync.barrier().poison();
                        if !payload.is::<BarrierPoisoned>() {
                            first_panic.lock().get_or_insert_with(|| panic_message(payload.as_ref()));
                        }
                    }
                });
            if let Err(source) = spawned {
                block.sync.barrier().poison();
                spawn_error = Some(source);
                break;
            }
        }
    });

    if let Some(message) = first_panic.into_inner() {
        return Err(BackendError::kernel_failed(kernel, acc, message));
    }
    if let Some(source) = spawn_error {
        return Err(BackendError::ThreadSpawn {
            what: format!("block thread for kernel `{kernel}`"),
            source,
        });
    }
    Ok(())
}
