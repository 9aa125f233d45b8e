//! Kernel launch tasks.

use std::fmt;
use std::marker::PhantomData;
use std::time::Instant;

use portacc_core::{validate_work_div, AccDevProps, Error, Limit, WorkDiv};
use portacc_tracing::perf_span;
use portacc_tracing::performance::record_launch;

use crate::backend::Acc;
use crate::error::Result;

/// A kernel closure bound to a work division and its arguments.
///
/// The closure runs once per logical thread with the accelerator context and
/// a clone of `args`.
pub struct TaskKernel<A, const D: usize, F, Args> {
    work_div: WorkDiv<D>,
    kernel: F,
    args: Args,
    dyn_shared_mem_bytes: usize,
    _acc: PhantomData<fn() -> A>,
}

/// Bind `kernel` and `args` to `work_div` for accelerator `A`.
///
/// `A` is usually inferred from the closure's first parameter:
///
/// ```rust
/// use portacc_backends::{create_task_kernel, AccCpuSerial, IdxProvider};
/// use portacc_core::{IdxVec, WorkDiv};
///
/// let task = create_task_kernel(
///     WorkDiv::new(IdxVec::new([4]), IdxVec::ones(), IdxVec::ones()),
///     |acc: &AccCpuSerial<1>, scale: u32| {
///         let _ = acc.grid_thread_idx()[0] as u32 * scale;
///     },
///     3u32,
/// );
/// assert_eq!(task.work_div().grid_block_count(), 4);
/// ```
pub fn create_task_kernel<A, const D: usize, F, Args>(
    work_div: WorkDiv<D>,
    kernel: F,
    args: Args,
) -> TaskKernel<A, D, F, Args>
where
    A: Acc<D>,
    F: Fn(&A, Args) + Send + Sync + 'static,
    Args: Clone + Send + Sync + 'static,
{
    TaskKernel {
        work_div,
        kernel,
        args,
        dyn_shared_mem_bytes: 0,
        _acc: PhantomData,
    }
}

impl<A, const D: usize, F, Args> TaskKernel<A, D, F, Args>
where
    A: Acc<D>,
    F: Fn(&A, Args) + Send + Sync + 'static,
    Args: Clone + Send + Sync + 'static,
{
    /// Request `bytes` of dynamic block-shared memory per block.
    pub fn with_dyn_shared_mem_bytes(mut self, bytes: usize) -> Self {
        self.dyn_shared_mem_bytes = bytes;
        self
    }

    pub fn work_div(&self) -> &WorkDiv<D> {
        &self.work_div
    }

    pub fn dyn_shared_mem_bytes(&self) -> usize {
        self.dyn_shared_mem_bytes
    }

    /// Type name of the kernel closure, used in diagnostics.
    pub fn kernel_name(&self) -> &'static str {
        std::any::type_name::<F>()
    }

    /// Run the kernel body for the thread described by `acc`.
    pub fn invoke(&self, acc: &A) {
        (self.kernel)(acc, self.args.clone())
    }
}

/// Check `task` against `A`'s limits on `dev` before anything is queued.
pub(crate) fn validate_launch<A, const D: usize, F, Args>(
    dev: &A::Dev,
    task: &TaskKernel<A, D, F, Args>,
) -> Result<AccDevProps<D>>
where
    A: Acc<D>,
    F: Fn(&A, Args) + Send + Sync + 'static,
    Args: Clone + Send + Sync + 'static,
{
    let props = A::dev_props(dev)?;
    validate_work_div(&props, task.work_div())?;
    if task.dyn_shared_mem_bytes() > props.shared_mem_size_bytes {
        return Err(Error::limit(
            Limit::BlockSharedMemBytes,
            None,
            task.dyn_shared_mem_bytes(),
            props.shared_mem_size_bytes,
        )
        .into());
    }
    Ok(props)
}

/// Static and dynamic shared memory per block for `task`.
pub(crate) fn block_shared_bytes<A, const D: usize, F, Args>(
    props: &AccDevProps<D>,
    task: &TaskKernel<A, D, F, Args>,
) -> (usize, usize)
where
    A: Acc<D>,
    F: Fn(&A, Args) + Send + Sync + 'static,
    Args: Clone + Send + Sync + 'static,
{
    let dyn_bytes = task.dyn_shared_mem_bytes();
    (props.shared_mem_size_bytes.saturating_sub(dyn_bytes), dyn_bytes)
}

/// Execute `task` on `dev` and record the launch.
pub(crate) fn run_task<A, const D: usize, F, Args>(dev: &A::Dev, task: &TaskKernel<A, D, F, Args>) -> Result<()>
where
    A: Acc<D>,
    F: Fn(&A, Args) + Send + Sync + 'static,
    Args: Clone + Send + Sync + 'static,
{
    let acc = A::acc_name();
    let work_div = task.work_div();
    let _span = perf_span!("kernel_launch", kernel = task.kernel_name(), acc = acc.as_str());
    let start = Instant::now();
    A::execute(dev, task)?;
    record_launch(
        task.kernel_name(),
        &acc,
        work_div.grid_block_count(),
        work_div.block_thread_count(),
        start.elapsed().as_micros() as u64,
    );
    Ok(())
}

impl<A, const D: usize, F, Args> fmt::Debug for TaskKernel<A, D, F, Args> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskKernel")
            .field("kernel", &std::any::type_name::<F>())
            .field("work_div", &self.work_div)
            .field("dyn_shared_mem_bytes", &self.dyn_shared_mem_bytes)
            .finish()
    }
}
