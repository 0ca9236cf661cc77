use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use unimem_core::pools::{PROXY_POOL_OPS, TRACE_POOL_OPS, TracePoolParams};
use unimem_core::providers::{
    NULL_MEMORY_PROVIDER_OPS, TRACE_PROVIDER_OPS, TraceObserver, TraceProviderParams,
};
use unimem_core::{
    MemError, MemResult, MemoryPool, MemoryPoolOps, MemoryProvider, MemoryProviderOps,
    NativeError, OPS_VERSION_CURRENT, PoolCreateFlags, PoolOps, ProviderOps,
};

/// Provider backed by the C heap; `free` ignores the size.
struct MallocProvider {
    drops: Arc<AtomicUsize>,
}

static MALLOC_PROVIDER_OPS: ProviderOps<Arc<AtomicUsize>> = ProviderOps::new(malloc_initialize);

fn malloc_initialize(drops: Arc<AtomicUsize>) -> MemResult<Box<dyn MemoryProviderOps>> {
    Ok(Box::new(MallocProvider { drops }))
}

impl MemoryProviderOps for MallocProvider {
    fn alloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>> {
        let alignment = alignment.max(std::mem::size_of::<usize>());
        let mut out = std::ptr::null_mut();
        // SAFETY: posix_memalign only writes `out`.
        let rc = unsafe { libc::posix_memalign(&mut out, alignment, size.max(1)) };
        if rc != 0 {
            return Err(MemError::OutOfHostMemory);
        }
        NonNull::new(out.cast()).ok_or(MemError::OutOfHostMemory)
    }

    unsafe fn free(&self, ptr: *mut u8, _size: usize) -> MemResult<()> {
        // SAFETY: pointer came from posix_memalign.
        unsafe { libc::free(ptr.cast()) };
        Ok(())
    }

    fn last_native_error(&self) -> NativeError {
        NativeError::default()
    }

    fn name(&self) -> &'static str {
        "malloc"
    }
}

impl Drop for MallocProvider {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn malloc_provider(drops: &Arc<AtomicUsize>) -> MemoryProvider {
    MemoryProvider::create(&MALLOC_PROVIDER_OPS, Arc::clone(drops)).expect("malloc provider")
}

fn null_provider() -> MemoryProvider {
    MemoryProvider::create(&NULL_MEMORY_PROVIDER_OPS, ()).expect("null provider")
}

#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    fn observer(&self) -> TraceObserver {
        let calls = Arc::clone(&self.0);
        Arc::new(move |op| calls.lock().push(op))
    }

    fn count(&self, op: &str) -> usize {
        self.0.lock().iter().filter(|c| **c == op).count()
    }

    fn total(&self) -> usize {
        self.0.lock().len()
    }
}

fn traced(upstream: MemoryProvider, log: &CallLog) -> MemoryProvider {
    MemoryProvider::create(
        &TRACE_PROVIDER_OPS,
        TraceProviderParams {
            upstream,
            observer: log.observer(),
        },
    )
    .expect("trace provider")
}

#[test]
fn proxy_pool_maps_each_call_to_one_provider_call() {
    let drops = Arc::new(AtomicUsize::new(0));
    let log = CallLog::default();
    let provider = traced(malloc_provider(&drops), &log);
    let pool = MemoryPool::create(&PROXY_POOL_OPS, &provider, (), PoolCreateFlags::empty())
        .expect("proxy pool");

    let p = pool.malloc(64).expect("malloc");
    assert_eq!(log.count("alloc"), 1);
    // SAFETY: 64 fresh bytes.
    unsafe { p.as_ptr().write_bytes(0xEE, 64) };

    let z = pool.calloc(4, 16).expect("calloc");
    assert_eq!(log.count("alloc"), 2);
    // SAFETY: calloc returned 64 bytes.
    let zeroed = unsafe { std::slice::from_raw_parts(z.as_ptr(), 64) };
    assert!(zeroed.iter().all(|b| *b == 0));

    let a = pool.aligned_malloc(100, 256).expect("aligned_malloc");
    assert_eq!(a.as_ptr() as usize % 256, 0);
    assert_eq!(log.count("alloc"), 3);
    assert!(pool.last_allocation_error().is_ok());

    let before = log.total();
    // SAFETY: live allocation of this pool; the pointer is not read.
    unsafe {
        assert_eq!(pool.malloc_usable_size(p.as_ptr()), Err(MemError::NotSupported));
        assert_eq!(pool.realloc(p.as_ptr(), 128).err(), Some(MemError::NotSupported));
    }
    assert_eq!(log.total(), before);
    assert_eq!(pool.last_allocation_error(), Err(MemError::NotSupported));

    // SAFETY: each allocation freed once.
    unsafe {
        pool.free(p.as_ptr()).expect("free");
        pool.free(z.as_ptr()).expect("free");
        pool.free(a.as_ptr()).expect("free");
    }
    assert_eq!(log.count("free"), 3);
    assert_eq!(log.total(), before + 3);

    drop(pool);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(provider);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn proxy_calloc_overflow_is_rejected_without_provider_call() {
    let log = CallLog::default();
    let pool = MemoryPool::create(
        &PROXY_POOL_OPS,
        traced(null_provider(), &log),
        (),
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect("proxy pool");
    assert_eq!(pool.calloc(usize::MAX, 2).err(), Some(MemError::InvalidArgument));
    assert_eq!(pool.last_allocation_error(), Err(MemError::InvalidArgument));
    assert_eq!(log.count("alloc"), 0);
}

#[test]
fn trace_pool_invokes_observer_once_per_operation() {
    let pool_log = CallLog::default();
    let provider_log = CallLog::default();

    let inner = MemoryPool::create(
        &PROXY_POOL_OPS,
        traced(null_provider(), &provider_log),
        (),
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect("proxy pool");
    let pool = MemoryPool::create(
        &TRACE_POOL_OPS,
        null_provider(),
        TracePoolParams {
            pool: inner,
            observer: pool_log.observer(),
        },
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect("trace pool");

    let p = pool.malloc(0).expect("malloc");
    assert_eq!(pool_log.count("malloc"), 1);
    assert_eq!(provider_log.count("alloc"), 1);

    // SAFETY: zero-sized allocation of the wrapped pool.
    unsafe { pool.free(p.as_ptr()) }.expect("free");
    assert_eq!(pool_log.count("free"), 1);
    assert_eq!(provider_log.count("free"), 1);

    pool.calloc(0, 0).expect("calloc");
    assert_eq!(pool_log.count("calloc"), 1);
    assert_eq!(provider_log.count("alloc"), 2);

    // SAFETY: null is accepted; the proxy does not support realloc.
    let realloc = unsafe { pool.realloc(std::ptr::null_mut(), 0) };
    assert_eq!(realloc.err(), Some(MemError::NotSupported));
    assert_eq!(pool_log.count("realloc"), 1);
    assert_eq!(provider_log.total(), 3);

    pool.aligned_malloc(0, 0).expect("aligned_malloc");
    assert_eq!(pool_log.count("aligned_malloc"), 1);
    assert_eq!(provider_log.count("alloc"), 3);

    // SAFETY: the proxy never dereferences the pointer.
    let usable = unsafe { pool.malloc_usable_size(p.as_ptr()) };
    assert_eq!(usable, Err(MemError::NotSupported));
    assert_eq!(pool_log.count("malloc_usable_size"), 1);
    assert_eq!(provider_log.total(), 4);

    assert!(pool.last_allocation_error().is_ok());
    assert_eq!(pool_log.count("get_last_allocation_error"), 1);
    assert_eq!(pool_log.total(), 7);
    assert_eq!(provider_log.total(), 4);
}

#[test]
fn trace_pool_count_law_holds_over_heap_memory() {
    let drops = Arc::new(AtomicUsize::new(0));
    let pool_log = CallLog::default();
    let provider_log = CallLog::default();

    let inner = MemoryPool::create(
        &PROXY_POOL_OPS,
        traced(malloc_provider(&drops), &provider_log),
        (),
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect("proxy pool");
    let pool = MemoryPool::create(
        &TRACE_POOL_OPS,
        null_provider(),
        TracePoolParams {
            pool: inner,
            observer: pool_log.observer(),
        },
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect("trace pool");

    let p = pool.malloc(96).expect("malloc");
    // SAFETY: 96 fresh bytes, freed once below.
    unsafe {
        p.as_ptr().write_bytes(0x5A, 96);
        pool.free(p.as_ptr()).expect("free");
    }

    let z = pool.calloc(8, 32).expect("calloc");
    // SAFETY: calloc returned 256 bytes.
    let zeroed = unsafe { std::slice::from_raw_parts(z.as_ptr(), 256) };
    assert!(zeroed.iter().all(|b| *b == 0));

    // SAFETY: `z` is live; the proxy rejects realloc without touching it.
    let realloc = unsafe { pool.realloc(z.as_ptr(), 512) };
    assert_eq!(realloc.err(), Some(MemError::NotSupported));

    let a = pool.aligned_malloc(200, 128).expect("aligned_malloc");
    assert_eq!(a.as_ptr() as usize % 128, 0);
    // SAFETY: 200 fresh bytes.
    unsafe { a.as_ptr().write_bytes(0xA5, 200) };

    // SAFETY: live allocation of this pool.
    let usable = unsafe { pool.malloc_usable_size(a.as_ptr()) };
    assert_eq!(usable.err(), Some(MemError::NotSupported));

    for op in ["malloc", "free", "calloc", "realloc", "aligned_malloc", "malloc_usable_size"] {
        assert_eq!(pool_log.count(op), 1, "{op}");
    }
    assert_eq!(pool_log.total(), 6);
    assert_eq!(provider_log.count("alloc"), 3);
    assert_eq!(provider_log.count("free"), 1);
    assert_eq!(provider_log.total(), 4);

    // SAFETY: remaining live allocations, each freed once.
    unsafe {
        pool.free(z.as_ptr()).expect("free");
        pool.free(a.as_ptr()).expect("free");
    }
    drop(pool);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn owned_provider_is_destroyed_with_pool_and_borrowed_is_not() {
    let drops = Arc::new(AtomicUsize::new(0));

    let owned = MemoryPool::create(
        &PROXY_POOL_OPS,
        malloc_provider(&drops),
        (),
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect("owned pool");
    assert!(owned.owns_provider());
    assert_eq!(owned.memory_provider().name(), "malloc");
    drop(owned);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    let provider = malloc_provider(&drops);
    let borrowed = MemoryPool::create(&PROXY_POOL_OPS, &provider, (), PoolCreateFlags::empty())
        .expect("borrowed pool");
    assert!(!borrowed.owns_provider());
    assert_eq!(borrowed.memory_provider().id(), provider.id());
    drop(borrowed);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    drop(provider);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn reserved_or_mismatched_flags_are_rejected() {
    let drops = Arc::new(AtomicUsize::new(0));
    let provider = malloc_provider(&drops);

    for bits in [1 << 1, 1 << 5, 1 << 31, PoolCreateFlags::OWN_PROVIDER.bits() | 1 << 3] {
        let result = MemoryPool::create(
            &PROXY_POOL_OPS,
            &provider,
            (),
            PoolCreateFlags::from_bits_retain(bits),
        );
        let err = result.expect_err("reserved bits");
        assert_eq!(err.error, MemError::InvalidArgument, "bits={bits:#x}");
        assert!(err.provider.is_none());
    }

    let result = MemoryPool::create(
        &PROXY_POOL_OPS,
        &provider,
        (),
        PoolCreateFlags::OWN_PROVIDER,
    );
    assert_eq!(result.err().map(|e| e.error), Some(MemError::InvalidArgument));

    let create = || -> MemResult<()> {
        MemoryPool::create(&PROXY_POOL_OPS, &provider, (), PoolCreateFlags::OWN_PROVIDER)?;
        Ok(())
    };
    assert_eq!(create(), Err(MemError::InvalidArgument));

    let owned = malloc_provider(&drops);
    let owned_id = owned.id();
    let err = MemoryPool::create(&PROXY_POOL_OPS, owned, (), PoolCreateFlags::empty())
        .expect_err("flag missing for owned provider");
    assert_eq!(err.error, MemError::InvalidArgument);
    let returned = err.into_provider().expect("provider handed back");
    assert_eq!(returned.id(), owned_id);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(returned);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(provider.name(), "malloc");
}

#[test]
fn rejected_owning_create_leaves_provider_usable() {
    let drops = Arc::new(AtomicUsize::new(0));
    let provider = malloc_provider(&drops);
    let flags = PoolCreateFlags::from_bits_retain(PoolCreateFlags::OWN_PROVIDER.bits() | 1 << 3);

    let err = MemoryPool::create(&PROXY_POOL_OPS, provider, (), flags)
        .expect_err("reserved bit");
    assert_eq!(err.error, MemError::InvalidArgument);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    let provider = err.into_provider().expect("provider handed back");
    let p = provider.alloc(32, 0).expect("alloc");
    // SAFETY: allocation of this provider, freed once.
    unsafe { provider.free(p.as_ptr(), 32) }.expect("free");

    // A corrected call with the same provider succeeds and owns it.
    let pool = MemoryPool::create(&PROXY_POOL_OPS, provider, (), PoolCreateFlags::OWN_PROVIDER)
        .expect("proxy pool");
    assert!(pool.owns_provider());
    drop(pool);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

struct NoopPool;

impl MemoryPoolOps for NoopPool {
    fn malloc(&self, _provider: &MemoryProvider, _size: usize) -> MemResult<NonNull<u8>> {
        Err(MemError::OutOfHostMemory)
    }

    unsafe fn free(&self, _provider: &MemoryProvider, _ptr: *mut u8) -> MemResult<()> {
        Ok(())
    }

    fn last_allocation_error(&self) -> MemResult<()> {
        Ok(())
    }
}

fn noop_pool_initialize(
    _provider: &MemoryProvider,
    _params: (),
) -> MemResult<Box<dyn MemoryPoolOps>> {
    Ok(Box::new(NoopPool))
}

fn unreachable_pool_initialize(
    _provider: &MemoryProvider,
    _params: (),
) -> MemResult<Box<dyn MemoryPoolOps>> {
    panic!("pool initialize ran despite a version mismatch");
}

fn unreachable_provider_initialize(_params: ()) -> MemResult<Box<dyn MemoryProviderOps>> {
    panic!("provider initialize ran despite a version mismatch");
}

#[test]
fn mismatched_ops_version_is_rejected_before_initialize() {
    let pool_ops = PoolOps {
        version: OPS_VERSION_CURRENT + 1,
        initialize: unreachable_pool_initialize,
    };
    let provider_ops = ProviderOps {
        version: OPS_VERSION_CURRENT.wrapping_sub(1),
        initialize: unreachable_provider_initialize,
    };

    let drops = Arc::new(AtomicUsize::new(0));
    let err = MemoryPool::create(
        &pool_ops,
        malloc_provider(&drops),
        (),
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect_err("version mismatch");
    assert_eq!(err.error, MemError::InvalidArgument);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(err.into_provider().is_some());
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    assert_eq!(
        MemoryProvider::create(&provider_ops, ()).err(),
        Some(MemError::InvalidArgument)
    );
}

fn failing_pool_initialize(
    _provider: &MemoryProvider,
    err: MemError,
) -> MemResult<Box<dyn MemoryPoolOps>> {
    Err(err)
}

static FAILING_POOL_OPS: PoolOps<MemError> = PoolOps::new(failing_pool_initialize);

fn failing_provider_initialize(err: MemError) -> MemResult<Box<dyn MemoryProviderOps>> {
    Err(err)
}

static FAILING_PROVIDER_OPS: ProviderOps<MemError> = ProviderOps::new(failing_provider_initialize);

#[test]
fn initialize_errors_surface_unchanged() {
    let drops = Arc::new(AtomicUsize::new(0));
    let classes = [
        MemError::OutOfHostMemory,
        MemError::InvalidArgument,
        MemError::ProviderSpecific,
        MemError::Unknown,
    ];
    for (i, err) in classes.into_iter().enumerate() {
        let failed = MemoryPool::create(
            &FAILING_POOL_OPS,
            malloc_provider(&drops),
            err,
            PoolCreateFlags::OWN_PROVIDER,
        )
        .expect_err("initialize fails");
        assert_eq!(failed.error, err);
        assert_eq!(drops.load(Ordering::SeqCst), i);
        let provider = failed.into_provider().expect("provider handed back");
        assert_eq!(provider.name(), "malloc");
        drop(provider);
        assert_eq!(drops.load(Ordering::SeqCst), i + 1);

        assert_eq!(
            MemoryProvider::create(&FAILING_PROVIDER_OPS, err).err(),
            Some(err)
        );
    }
}

#[test]
fn default_pool_operations_report_not_supported() {
    let provider = null_provider();
    let pool = MemoryPool::create(
        &PoolOps::new(noop_pool_initialize),
        &provider,
        (),
        PoolCreateFlags::empty(),
    )
    .expect("noop pool");
    assert_eq!(pool.calloc(1, 1).err(), Some(MemError::NotSupported));
    assert_eq!(pool.aligned_malloc(8, 8).err(), Some(MemError::NotSupported));
    // SAFETY: the default implementations never touch the pointer.
    unsafe {
        assert_eq!(pool.realloc(std::ptr::null_mut(), 8).err(), Some(MemError::NotSupported));
        assert_eq!(
            pool.malloc_usable_size(std::ptr::null()),
            Err(MemError::NotSupported)
        );
        assert!(pool.free(std::ptr::null_mut()).is_ok());
    }
    assert_eq!(pool.malloc(8).err(), Some(MemError::OutOfHostMemory));
    assert!(pool.last_allocation_error().is_ok());
}

#[test]
fn default_provider_operations_report_not_supported() {
    let drops = Arc::new(AtomicUsize::new(0));
    let provider = malloc_provider(&drops);
    assert_eq!(provider.recommended_page_size(4096), Err(MemError::NotSupported));
    assert_eq!(provider.min_page_size(std::ptr::null()), Err(MemError::NotSupported));
    // SAFETY: the default implementations never touch the pointers.
    unsafe {
        let null = std::ptr::null_mut();
        assert_eq!(provider.purge_lazy(null, 0), Err(MemError::NotSupported));
        assert_eq!(provider.purge_force(null, 0), Err(MemError::NotSupported));
        assert_eq!(provider.allocation_split(null, 2, 1), Err(MemError::NotSupported));
        assert_eq!(provider.allocation_merge(null, null, 2), Err(MemError::NotSupported));
    }
    assert_eq!(provider.last_native_error(), NativeError::default());
}

#[test]
fn handle_ids_are_unique() {
    let a = null_provider();
    let b = null_provider();
    assert_ne!(a.id(), b.id());
    let p = MemoryPool::create(&PROXY_POOL_OPS, &a, (), PoolCreateFlags::empty()).unwrap();
    let q = MemoryPool::create(&PROXY_POOL_OPS, &b, (), PoolCreateFlags::empty()).unwrap();
    assert_ne!(p.id(), q.id());
}

#[test]
fn shared_pool_serves_many_threads() {
    let drops = Arc::new(AtomicUsize::new(0));
    let pool = MemoryPool::create(
        &PROXY_POOL_OPS,
        malloc_provider(&drops),
        (),
        PoolCreateFlags::OWN_PROVIDER,
    )
    .expect("proxy pool");

    std::thread::scope(|s| {
        for t in 0..8u8 {
            let pool = &pool;
            s.spawn(move || {
                for i in 0..200usize {
                    let size = 16 + (i % 7) * 24;
                    let p = pool.malloc(size).expect("malloc");
                    // SAFETY: `size` fresh bytes, freed once below.
                    unsafe {
                        p.as_ptr().write_bytes(t, size);
                        assert_eq!(*p.as_ptr().add(size - 1), t);
                        pool.free(p.as_ptr()).expect("free");
                    }
                }
            });
        }
    });
    drop(pool);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}
