use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    SIGINT_SEEN.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() -> io::Result<()> {
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = 0;
        if libc::sigaction(libc::SIGINT, &act, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Shared stop flag.
///
/// Clones observe the same flag. Loops check it at iteration boundaries and
/// while polling for completions; blocking socket calls are not cut short.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    sigint: bool,
}

impl Interrupt {
    /// A flag only [`Interrupt::trigger`] sets.
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is also set by SIGINT.
    pub fn with_sigint() -> io::Result<Self> {
        install_sigint_handler()?;
        Ok(Self {
            flag: Arc::default(),
            sigint: true,
        })
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.sigint && SIGINT_SEEN.load(Ordering::SeqCst))
    }
}
