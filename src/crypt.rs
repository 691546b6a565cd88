//! Process-wide binding to the platform crypt(3) implementation.
//!
//! # Loading
//!
//! The library is located by probing a fixed, ordered list of shared-object
//! names (`libxcrypt`, `libcrypt`, finally `libc` itself) with `dlopen`. The
//! first library that yields a usable symbol is retained for the lifetime of
//! the process; nothing is ever `dlclose`d once selected.
//!
//! # Reentrancy
//!
//! `crypt_ra` is preferred: it writes into caller-owned scratch, so every
//! worker thread keeps its own `(data, size)` pair in a thread-local and the
//! calls run fully in parallel. The scratch is allocated and resized by the
//! library; we free it with `libc::free` when the owning thread exits.
//!
//! When only the classic `crypt` symbol exists, all calls are serialized
//! behind a single mutex, since `crypt` returns a pointer into static
//! storage.
//!
//! # Ordering
//!
//! The binding itself is immutable after `OnceLock` initialization; no
//! further synchronization is required for the reentrant path.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::{Mutex, OnceLock};

use libc::{c_char, c_int, c_void};

/// Probe order for the crypt library. First hit wins.
const LIBRARY_NAMES: &[&str] = &[
    "libxcrypt.so.2",
    "libxcrypt.so.1",
    "libxcrypt.so.0",
    "libcrypt.so.2",
    "libcrypt.so.1",
    "libcrypt.so",
    "libc.so.6",
];

type CryptRaFn =
    unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut c_void, *mut c_int) -> *mut c_char;
type CryptFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut c_char;

/// Errors from locating the crypt implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CryptError {
    /// No probed library exported `crypt_ra` or `crypt`.
    NoCryptFunction,
}

impl fmt::Display for CryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCryptFunction => write!(
                f,
                "no crypt function found: none of {LIBRARY_NAMES:?} exports crypt_ra or crypt"
            ),
        }
    }
}

impl std::error::Error for CryptError {}

enum Entry {
    /// `crypt_ra` with caller-owned per-thread scratch.
    Reentrant(CryptRaFn),
    /// Classic `crypt`; every call holds [`CryptBinding::serial`].
    Serialized(CryptFn),
}

/// The resolved crypt entry point plus the retained library handle.
pub struct CryptBinding {
    entry: Entry,
    /// Library name that won the probe, for diagnostics.
    library: &'static str,
    /// Keeps the shared object mapped; intentionally never closed.
    _handle: *mut c_void,
    serial: Mutex<()>,
}

// SAFETY: the handle is only held to pin the library mapping; it is never
// dereferenced after load. Function pointers are immutable. The serialized
// entry is guarded by `serial`.
unsafe impl Send for CryptBinding {}
unsafe impl Sync for CryptBinding {}

static BINDING: OnceLock<Result<CryptBinding, CryptError>> = OnceLock::new();

/// Returns the process-wide binding, loading it on first use.
pub fn binding() -> Result<&'static CryptBinding, CryptError> {
    match BINDING.get_or_init(load) {
        Ok(b) => Ok(b),
        Err(e) => Err(e.clone()),
    }
}

fn load() -> Result<CryptBinding, CryptError> {
    for &name in LIBRARY_NAMES {
        let cname = CString::new(name).expect("library names contain no NUL");
        let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            continue;
        }

        if let Some(sym) = resolve(handle, "crypt_ra") {
            tracing::debug!(library = name, symbol = "crypt_ra", "crypt binding loaded");
            return Ok(CryptBinding {
                // SAFETY: crypt_ra has the documented 4-argument signature.
                entry: Entry::Reentrant(unsafe { std::mem::transmute::<*mut c_void, CryptRaFn>(sym) }),
                library: name,
                _handle: handle,
                serial: Mutex::new(()),
            });
        }
        if let Some(sym) = resolve(handle, "crypt") {
            tracing::debug!(library = name, symbol = "crypt", "crypt binding loaded (serialized)");
            return Ok(CryptBinding {
                // SAFETY: crypt has the documented 2-argument signature.
                entry: Entry::Serialized(unsafe { std::mem::transmute::<*mut c_void, CryptFn>(sym) }),
                library: name,
                _handle: handle,
                serial: Mutex::new(()),
            });
        }

        // Loaded but useless; release and keep probing.
        unsafe { libc::dlclose(handle) };
    }
    Err(CryptError::NoCryptFunction)
}

fn resolve(handle: *mut c_void, symbol: &str) -> Option<*mut c_void> {
    let csym = CString::new(symbol).expect("symbol names contain no NUL");
    let ptr = unsafe { libc::dlsym(handle, csym.as_ptr()) };
    (!ptr.is_null()).then_some(ptr)
}

/// Per-thread scratch for `crypt_ra`, allocated and resized by the library.
struct RaScratch {
    data: *mut c_void,
    size: c_int,
}

impl RaScratch {
    const fn new() -> Self {
        Self {
            data: std::ptr::null_mut(),
            size: 0,
        }
    }
}

impl Drop for RaScratch {
    fn drop(&mut self) {
        if !self.data.is_null() {
            // SAFETY: crypt_ra allocates with malloc/realloc; free matches.
            unsafe { libc::free(self.data) };
            self.data = std::ptr::null_mut();
        }
    }
}

thread_local! {
    static RA_SCRATCH: RefCell<RaScratch> = const { RefCell::new(RaScratch::new()) };
}

impl CryptBinding {
    /// The shared-object name the probe settled on.
    pub fn library(&self) -> &'static str {
        self.library
    }

    /// Whether the reentrant `crypt_ra` entry was found.
    pub fn is_reentrant(&self) -> bool {
        matches!(self.entry, Entry::Reentrant(_))
    }

    /// Hashes `candidate` under `setting` and returns the full crypt output,
    /// or `None` when the library rejects the input (unsupported setting,
    /// embedded NUL, empty setting).
    ///
    /// Safe to call from any thread; the non-reentrant fallback serializes
    /// internally.
    pub fn crypt_wrap(&self, candidate: &str, setting: &str) -> Option<String> {
        if setting.is_empty() {
            return None;
        }
        let key = CString::new(candidate).ok()?;
        let set = CString::new(setting).ok()?;

        match self.entry {
            Entry::Reentrant(f) => RA_SCRATCH.with(|scratch| {
                let mut guard = scratch.borrow_mut();
                let RaScratch { data, size } = &mut *guard;
                // SAFETY: key/set are valid NUL-terminated strings for the
                // duration of the call; data/size form the library-owned
                // scratch pair this thread exclusively owns.
                let out = unsafe { f(key.as_ptr(), set.as_ptr(), data, size) };
                copy_result(out)
            }),
            Entry::Serialized(f) => {
                let _guard = self.serial.lock().expect("crypt serial mutex poisoned");
                // SAFETY: serialized by the mutex; result points into static
                // storage and is copied out before the guard drops.
                let out = unsafe { f(key.as_ptr(), set.as_ptr()) };
                copy_result(out)
            }
        }
    }
}

/// Copies a C result string into owned memory; NULL becomes `None`.
fn copy_result(out: *mut c_char) -> Option<String> {
    if out.is_null() {
        return None;
    }
    // SAFETY: a non-NULL return from crypt/crypt_ra is a NUL-terminated string.
    let s = unsafe { CStr::from_ptr(out) };
    s.to_str().ok().map(str::to_owned)
}
