//! Threading layer similar to `std::thread` but with countable park tokens
//! and a remote preemption operation ([`Thread::preempt`]).
use std::{
    cell::Cell,
    mem::MaybeUninit,
    os::raw::c_int,
    ptr::null,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    thread,
};

thread_local! {
    // Accessed from the preemption signal handler, so it must not require
    // lazy initialization or run destructors on access.
    static THREAD_DATA: Cell<*const ThreadData> = const { Cell::new(null()) };
}

// Releases the `Arc` reference stored in `THREAD_DATA` on thread exit.
thread_local! {
    static THREAD_DATA_DTOR: ThreadDataDestructor = ThreadDataDestructor;
}

struct ThreadDataDestructor;

impl Drop for ThreadDataDestructor {
    fn drop(&mut self) {
        let ptr = THREAD_DATA.with(|c| c.replace(null()));
        if !ptr.is_null() {
            unsafe { Arc::from_raw(ptr) };
        }
    }
}

/// [`std::thread::JoinHandle`] with extra functionalities.
#[derive(Debug)]
pub struct JoinHandle<T> {
    std_handle: thread::JoinHandle<T>,
    thread: Thread,
}

impl<T> JoinHandle<T> {
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn join(self) -> thread::Result<T> {
        self.std_handle.join()
    }
}

/// Spawn a new thread. The thread's park state is fully registered by the
/// time this function returns, so [`Thread::unpark`] and [`Thread::preempt`]
/// are immediately usable on the returned handle.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    let parent_thread = thread::current();

    let data = Arc::new(ThreadData::new());
    let data2 = Arc::clone(&data);

    let std_handle = thread::spawn(move || {
        // Set up a destructor for `THREAD_DATA`
        THREAD_DATA_DTOR.with(|_| {});

        data2.set_self();

        // Move `data2` into `THREAD_DATA`
        THREAD_DATA.with(|c| c.set(Arc::into_raw(data2)));

        parent_thread.unpark();
        drop(parent_thread);

        f()
    });

    let thread = Thread {
        std_thread: std_handle.thread().clone(),
        data,
    };

    // Wait until the just-spawned thread configures its own `THREAD_DATA`.
    thread::park();

    JoinHandle { std_handle, thread }
}

/// [`std::thread::Thread`] with extra functionalities.
#[derive(Debug, Clone)]
pub struct Thread {
    std_thread: thread::Thread,
    data: Arc<ThreadData>,
}

#[derive(Debug)]
struct ThreadData {
    park_sock: [c_int; 2],
    park_count: AtomicUsize,
    pthread_id: AtomicUsize,
}

impl ThreadData {
    fn new() -> Self {
        let park_sock = unsafe {
            let mut park_sock = MaybeUninit::uninit();
            ok_or_errno(libc::socketpair(
                libc::PF_LOCAL,
                libc::SOCK_STREAM,
                0,
                park_sock.as_mut_ptr() as _,
            ))
            .unwrap();
            park_sock.assume_init()
        };

        Self {
            park_sock,
            park_count: AtomicUsize::new(0),
            pthread_id: AtomicUsize::new(0),
        }
    }

    /// Assign `self.pthread_id` using `pthread_self`.
    fn set_self(&self) {
        self.pthread_id
            .store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
    }

    /// Get the FD to read a park token.
    fn park_sock_token_source(&self) -> c_int {
        self.park_sock[0]
    }

    /// Get the FD to write a park token.
    fn park_sock_token_sink(&self) -> c_int {
        self.park_sock[1]
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.park_sock[0]);
            libc::close(self.park_sock[1]);
        }
    }
}

/// Consume one park token, blocking until one is made available.
///
/// Must be called from a thread started by [`spawn`].
pub fn park() {
    let ptr = THREAD_DATA.with(|c| c.get());
    assert!(
        !ptr.is_null(),
        "this thread wasn't started by `threading::spawn`"
    );
    park_inner(unsafe { &*ptr });
}

fn park_inner(data: &ThreadData) {
    loop {
        // Take the token (blocking)
        match isize_ok_or_errno(unsafe {
            libc::recv(
                data.park_sock_token_source(),
                (&mut 0u8) as *mut _ as _,
                1,
                0,
            )
        }) {
            Ok(1) => {}
            Ok(0) | Err(errno::Errno(libc::EAGAIN)) => {
                // Spurious wakeup (this can be caused by how `unpark` is
                // implemented). Try again.
                continue;
            }
            Err(errno::Errno(libc::EINTR)) => {
                // Interrupted while waiting. Try again.
                continue;
            }
            Ok(i) => panic!("unexpected return value: {}", i),
            Err(e) => panic!("failed to evict park token: {}", e),
        }

        break;
    }
}

impl Thread {
    /// Make a new park token available for the thread.
    ///
    /// Unlike [`std::thread::Thread::unpark`], **a thread can have multiple
    /// tokens**. Each call to `park` will consume one token. The maximum
    /// number of tokens a thread can have is unspecified.
    pub fn unpark(&self) {
        let data = &self.data;

        // Make a token available
        isize_ok_or_errno(unsafe {
            libc::send(data.park_sock_token_sink(), &0u8 as *const _ as _, 1, 0)
        })
        .unwrap();
    }

    /// Force the thread to park at its current execution point.
    ///
    /// The effect is equivalent to the thread calling [`park`] itself, but
    /// this method can be called from any thread. It returns once the target
    /// thread has committed to parking.
    ///
    /// The result is unspecified if the thread has already exited.
    pub fn preempt(&self) {
        // Make sure the signal handler is registered
        static SIGNAL_HANDLER_ONCE: Once = Once::new();
        SIGNAL_HANDLER_ONCE.call_once(register_preempt_signal_handler);

        let pthread_id = self.data.pthread_id.load(Ordering::Relaxed) as libc::pthread_t;

        self.data.park_count.fetch_add(1, Ordering::Relaxed);

        // Raise `SIGNAL_PREEMPT`, forcing the target thread to execute
        // `preempt_signal_handler`.
        ok_or_errno(unsafe { libc::pthread_kill(pthread_id, SIGNAL_PREEMPT) }).unwrap();

        // Wait until the signal is delivered.
        while self.data.park_count.load(Ordering::Relaxed) != 0 {
            std::thread::yield_now();
        }
    }
}

const SIGNAL_PREEMPT: c_int = libc::SIGUSR1;

/// Register the signal handler for `SIGNAL_PREEMPT`.
#[cold]
fn register_preempt_signal_handler() {
    ok_or_errno(unsafe {
        libc::sigaction(
            SIGNAL_PREEMPT,
            &libc::sigaction {
                sa_sigaction: preempt_signal_handler as libc::sighandler_t,
                // `SA_SIGINFO`: The handler uses the three-parameter signature.
                sa_flags: libc::SA_SIGINFO,
                ..std::mem::zeroed()
            },
            std::ptr::null_mut(),
        )
    })
    .unwrap();

    /// The signal handler for `SIGNAL_PREEMPT`.
    extern "C" fn preempt_signal_handler(
        _signo: c_int,
        _: *mut libc::siginfo_t,
        _: *mut libc::ucontext_t,
    ) {
        let current_ptr = THREAD_DATA.with(|c| c.get());
        assert!(!current_ptr.is_null());
        let current = unsafe { &*current_ptr };

        while current.park_count.load(Ordering::Relaxed) != 0 {
            current.park_count.fetch_sub(1, Ordering::Relaxed);

            // Park the current thread
            park_inner(current);
        }
    }
}

fn isize_ok_or_errno(x: isize) -> Result<isize, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

fn ok_or_errno(x: c_int) -> Result<c_int, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::AtomicBool,
        thread::sleep,
        time::Duration,
    };

    #[test]
    fn unpark_before_park_is_counted() {
        let jh = spawn(|| {
            // Both tokens were made available before we first parked
            park();
            park();
        });
        jh.thread().unpark();
        jh.thread().unpark();
        jh.join().unwrap();
    }

    #[test]
    fn preempt_stops_spinning_thread() {
        static RESUMED: AtomicBool = AtomicBool::new(false);

        let jh = spawn(|| {
            park();
            loop {
                if RESUMED.load(Ordering::Relaxed) {
                    break;
                }
            }
        });
        jh.thread().unpark();
        sleep(Duration::from_millis(50));

        // Park the thread remotely, then prove it isn't running by setting
        // the exit flag and observing no exit until we unpark it.
        jh.thread().preempt();
        RESUMED.store(true, Ordering::Relaxed);
        sleep(Duration::from_millis(50));

        jh.thread().unpark();
        jh.join().unwrap();
    }

    #[test]
    fn returning_releases_thread_data() {
        let jh = spawn(|| {});

        // Wait until the child thread exits
        sleep(Duration::from_millis(200));

        // `jh` should be the sole owner of `ThreadData` now
        assert_eq!(Arc::strong_count(&jh.thread.data), 1);
    }
}
