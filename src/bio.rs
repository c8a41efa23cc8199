use crate::buf::{BufAllocator, ByteBuf};
use libc::{c_char, c_int, c_long, c_void};
use openssl_sys as ffi;
use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::slice;
use std::sync::OnceLock;

// BIO ctrl numbers not exported by openssl-sys.  Values match
// <openssl/bio.h>, where these are macros.
const BIO_CTRL_GET_CLOSE: c_int = 8;
const BIO_CTRL_SET_CLOSE: c_int = 9;
const BIO_CLOSE: c_long = 1;

extern "C" {
    // libcrypto functions not bound by openssl-sys
    fn BIO_up_ref(a: *mut ffi::BIO) -> c_int;
    fn BIO_meth_set_gets(
        biom: *mut ffi::BIO_METHOD,
        gets: Option<unsafe extern "C" fn(*mut ffi::BIO, *mut c_char, c_int) -> c_int>,
    ) -> c_int;
}

/// OpenSSL BIO backed by in-memory [`ByteBuf`]s
///
/// This gives an OpenSSL `SSL` object somewhere to read ciphertext
/// from and write ciphertext to without owning a socket.  The glue
/// code feeds bytes that arrived from the network in with
/// [`ByteBufBio::receive_from_network`], and collects bytes that the
/// engine wants sent with [`ByteBufBio::outbound_ciphertext`].  The
/// engine side sees a perfectly ordinary BIO obtained from
/// [`ByteBufBio::retained_bio`], typically installed with
/// `SSL_set_bio`.
///
/// Writes from the engine coalesce into a single contiguous buffer,
/// so one extraction per event-loop tick yields one network write
/// however many TLS records the engine produced.  Extraction is
/// copy-free: the returned buffer shares storage with the shim, and
/// only a subsequent engine write while the caller still holds it
/// forces a duplication.
///
/// The BIO and the shim reference each other, which would leak, so
/// the cycle is broken explicitly: [`ByteBufBio::close`] (also run on
/// drop) clears the BIO's back-reference.  The engine may keep its
/// BIO references past that point; any callback arriving through them
/// fails with a non-retryable error, which the engine surfaces as a
/// broken connection.
///
/// Not thread-safe by design: every host call and every engine
/// callback must happen on the same thread, the normal arrangement
/// when the host's event loop drives the engine.
pub struct ByteBufBio {
    state: Rc<BioState>,
    bio: Cell<Option<NonNull<ffi::BIO>>>,
    closed: Cell<bool>,
}

/// One retained reference to the shim's BIO
///
/// Obtained from [`ByteBufBio::retained_bio`].  Dropping it releases
/// the reference; [`RetainedBio::into_raw`] instead hands the
/// reference to an API that consumes one, such as `SSL_set_bio`.
pub struct RetainedBio {
    bio: NonNull<ffi::BIO>,
}

struct BioState {
    allocator: BufAllocator,
    max_preserved_capacity: Option<usize>,
    outbound: RefCell<ByteBuf>,
    inbound: RefCell<Option<ByteBuf>>,
    close_flag: Cell<c_long>,
}

impl ByteBufBio {
    /// Create a shim with empty buffers
    ///
    /// `max_preserved_capacity` bounds how much outbound backing
    /// storage is kept across extractions; `None` means keep whatever
    /// has accumulated.  A single burst larger than the bound is
    /// still written and returned in full; the trim only applies to
    /// the storage retained for future writes.
    pub fn new(allocator: BufAllocator, max_preserved_capacity: Option<usize>) -> Self {
        Self {
            state: Rc::new(BioState {
                allocator,
                max_preserved_capacity,
                outbound: RefCell::new(allocator.buffer(0)),
                inbound: RefCell::new(None),
                close_flag: Cell::new(BIO_CLOSE),
            }),
            bio: Cell::new(None),
            closed: Cell::new(false),
        }
    }

    /// Get a retained reference to the BIO, creating it on first use
    ///
    /// Each call returns a separately-retained handle; each handle
    /// accounts for exactly one BIO reference.  The shim keeps one
    /// reference of its own until [`ByteBufBio::close`].
    pub fn retained_bio(&self) -> RetainedBio {
        assert!(!self.closed.get(), "ByteBufBio used after close");
        let bio = match self.bio.get() {
            Some(bio) => bio,
            None => {
                // SAFETY: plain constructor calls; the data slot takes
                // one strong count, balanced in close() or bbio_destroy.
                let bio = unsafe {
                    let bio = NonNull::new(ffi::BIO_new(bytebuf_method()))
                        .expect("BUG: BIO_new failed");
                    let state = Rc::into_raw(Rc::clone(&self.state));
                    ffi::BIO_set_data(bio.as_ptr(), state as *mut c_void);
                    ffi::BIO_set_init(bio.as_ptr(), 1);
                    bio
                };
                self.bio.set(Some(bio));
                bio
            }
        };
        // SAFETY: `bio` is live; the new reference is owned by the
        // returned handle.
        unsafe { BIO_up_ref(bio.as_ptr()) };
        RetainedBio { bio }
    }

    /// Feed ciphertext that arrived from the network
    ///
    /// The engine's next `read` callbacks drain it front to back.  If
    /// earlier ciphertext is still pending, the new bytes are
    /// appended behind it, so the engine observes one byte stream
    /// regardless of how the network chunked it.
    pub fn receive_from_network(&self, buffer: ByteBuf) {
        assert!(!self.closed.get(), "ByteBufBio used after close");
        let mut inbound = self.state.inbound.borrow_mut();
        match inbound.as_mut() {
            None => *inbound = Some(buffer),
            Some(pending) => pending.write_bytes(buffer.as_slice()),
        }
    }

    /// Take the ciphertext the engine has written since the last call
    ///
    /// Returns `None` if there is none.  Otherwise the accumulated
    /// buffer is handed over (it may outlive the shim) and the shim
    /// starts a fresh one.  If the old backing storage grew beyond
    /// `max_preserved_capacity` it is replaced by a fresh allocation
    /// of exactly that capacity; otherwise it is kept for reuse, and
    /// copy-on-write protects the returned buffer from subsequent
    /// engine writes.
    pub fn outbound_ciphertext(&self) -> Option<ByteBuf> {
        assert!(!self.closed.get(), "ByteBufBio used after close");
        let mut outbound = self.state.outbound.borrow_mut();
        if outbound.readable_bytes() == 0 {
            return None;
        }
        let extracted = outbound.clone();
        match self.state.max_preserved_capacity {
            Some(max) if extracted.capacity() > max => {
                *outbound = self.state.allocator.buffer(max);
            }
            _ => outbound.clear(),
        }
        Some(extracted)
    }

    /// Capacity of the outbound backing storage currently held for
    /// future writes.  Exposed so the preserved-capacity bound can be
    /// observed.
    pub fn outbound_buffer_capacity(&self) -> usize {
        self.state.outbound.borrow().capacity()
    }

    /// Detach from the BIO.  Idempotent, and the last call the host
    /// may make on this shim.
    ///
    /// Clears the BIO's back-reference, so callbacks from an engine
    /// that still holds the BIO fail as non-retryable, and releases
    /// the shim's own BIO reference.  The BIO itself is freed
    /// whenever the engine releases the last reference.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(bio) = self.bio.take() {
            // SAFETY: the shim still holds one reference, so `bio` is
            // live.  The slot's strong count is dropped exactly once:
            // here, or in bbio_destroy if the slot were still set.
            unsafe {
                let data = ffi::BIO_get_data(bio.as_ptr());
                if !data.is_null() {
                    ffi::BIO_set_data(bio.as_ptr(), ptr::null_mut());
                    drop(Rc::from_raw(data as *const BioState));
                }
                ffi::BIO_free_all(bio.as_ptr());
            }
        }
    }
}

impl Drop for ByteBufBio {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ByteBufBio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBufBio")
            .field("closed", &self.closed.get())
            .field("pending_outbound", &self.state.outbound.borrow().readable_bytes())
            .field(
                "pending_inbound",
                &self
                    .state
                    .inbound
                    .borrow()
                    .as_ref()
                    .map_or(0, ByteBuf::readable_bytes),
            )
            .finish()
    }
}

impl RetainedBio {
    /// The raw BIO pointer, without transferring the reference
    pub fn as_ptr(&self) -> *mut ffi::BIO {
        self.bio.as_ptr()
    }

    /// Hand the reference to an API that consumes one, e.g.
    /// `SSL_set_bio`, which takes a single reference when given the
    /// same BIO for both directions
    pub fn into_raw(self) -> *mut ffi::BIO {
        let bio = self.bio.as_ptr();
        mem::forget(self);
        bio
    }
}

impl Drop for RetainedBio {
    fn drop(&mut self) {
        // SAFETY: this handle owns exactly one reference.
        unsafe {
            ffi::BIO_free_all(self.bio.as_ptr());
        }
    }
}

impl fmt::Debug for RetainedBio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RetainedBio({:p})", self.bio.as_ptr())
    }
}

struct Method(NonNull<ffi::BIO_METHOD>);

// The method table is created once and never freed.
unsafe impl Send for Method {}
unsafe impl Sync for Method {}

fn bytebuf_method() -> *const ffi::BIO_METHOD {
    static METHOD: OnceLock<Method> = OnceLock::new();
    METHOD
        .get_or_init(|| {
            // SAFETY: plain constructor calls against a fresh table.
            unsafe {
                let method = NonNull::new(ffi::BIO_meth_new(
                    ffi::BIO_TYPE_NONE,
                    b"bytebuf\0".as_ptr() as *const c_char,
                ))
                .expect("BUG: BIO_meth_new failed");
                ffi::BIO_meth_set_write__fixed_rust(method.as_ptr(), Some(bbio_write));
                ffi::BIO_meth_set_read__fixed_rust(method.as_ptr(), Some(bbio_read));
                ffi::BIO_meth_set_puts__fixed_rust(method.as_ptr(), Some(bbio_puts));
                BIO_meth_set_gets(method.as_ptr(), Some(bbio_gets));
                ffi::BIO_meth_set_ctrl__fixed_rust(method.as_ptr(), Some(bbio_ctrl));
                ffi::BIO_meth_set_create__fixed_rust(method.as_ptr(), Some(bbio_create));
                ffi::BIO_meth_set_destroy__fixed_rust(method.as_ptr(), Some(bbio_destroy));
                Method(method)
            }
        })
        .0
        .as_ptr()
}

/// Borrow the shim state behind a BIO's user-data slot, or `None` if
/// the owning shim has been closed.
///
/// # Safety
///
/// `bio` must be a live BIO created from [`bytebuf_method`].  The
/// returned borrow is only used within one callback invocation;
/// `close` can only run between callbacks, never during one
/// (single-threaded contract).
unsafe fn shim_state<'a>(bio: *mut ffi::BIO) -> Option<&'a BioState> {
    // SAFETY: `bio` is live per the caller's contract.
    let data = unsafe { ffi::BIO_get_data(bio) };
    // SAFETY: non-null slot values are always `Rc::into_raw` of the
    // shim state, kept alive by the slot's own strong count.
    NonNull::new(data as *mut BioState).map(|state| unsafe { &*state.as_ptr() })
}

unsafe extern "C" fn bbio_write(bio: *mut ffi::BIO, buf: *const c_char, len: c_int) -> c_int {
    let Some(state) = (unsafe { shim_state(bio) }) else {
        // Shim closed under the engine: fatal, not retryable
        unsafe { ffi::BIO_clear_retry_flags(bio) };
        return -1;
    };
    if len == 0 {
        return 0;
    }
    if len < 0 || buf.is_null() {
        unsafe { ffi::BIO_clear_retry_flags(bio) };
        return -1;
    }
    unsafe { ffi::BIO_clear_retry_flags(bio) };
    // SAFETY: the engine guarantees `len` readable bytes at `buf`.
    let src = unsafe { slice::from_raw_parts(buf as *const u8, len as usize) };
    state.outbound.borrow_mut().write_bytes(src);
    len
}

unsafe extern "C" fn bbio_read(bio: *mut ffi::BIO, buf: *mut c_char, len: c_int) -> c_int {
    let Some(state) = (unsafe { shim_state(bio) }) else {
        unsafe { ffi::BIO_clear_retry_flags(bio) };
        return -1;
    };
    if len == 0 {
        return 0;
    }
    if len < 0 || buf.is_null() {
        unsafe { ffi::BIO_clear_retry_flags(bio) };
        return -1;
    }
    unsafe { ffi::BIO_clear_retry_flags(bio) };
    let mut inbound = state.inbound.borrow_mut();
    let Some(pending) = inbound.as_mut() else {
        // Nothing from the network yet: tell the engine to come back
        // once more ciphertext has been fed in
        unsafe { ffi::BIO_set_retry_read(bio) };
        return -1;
    };
    let count = pending.readable_bytes().min(len as usize);
    if count == 0 {
        unsafe { ffi::BIO_set_retry_read(bio) };
        return -1;
    }
    // SAFETY: the engine guarantees `len` writable bytes at `buf`.
    let dst = unsafe { slice::from_raw_parts_mut(buf as *mut u8, count) };
    dst.copy_from_slice(&pending.as_slice()[..count]);
    pending.advance_reader(count);
    if pending.readable_bytes() == 0 {
        // Fully drained: release the storage
        *inbound = None;
    }
    count as c_int
}

unsafe extern "C" fn bbio_puts(bio: *mut ffi::BIO, buf: *const c_char) -> c_int {
    let Some(state) = (unsafe { shim_state(bio) }) else {
        unsafe { ffi::BIO_clear_retry_flags(bio) };
        return -1;
    };
    if buf.is_null() {
        unsafe { ffi::BIO_clear_retry_flags(bio) };
        return -1;
    }
    // SAFETY: the engine passes a NUL-terminated string.
    let src = unsafe { CStr::from_ptr(buf) }.to_bytes();
    if src.len() > c_int::MAX as usize {
        unsafe { ffi::BIO_clear_retry_flags(bio) };
        return -1;
    }
    unsafe { ffi::BIO_clear_retry_flags(bio) };
    if !src.is_empty() {
        state.outbound.borrow_mut().write_bytes(src);
    }
    src.len() as c_int
}

// Line-oriented reads make no sense on a ciphertext pipe, so `gets`
// is refused outright, attached shim or not.
unsafe extern "C" fn bbio_gets(bio: *mut ffi::BIO, _buf: *mut c_char, _len: c_int) -> c_int {
    unsafe { ffi::BIO_clear_retry_flags(bio) };
    -2
}

unsafe extern "C" fn bbio_ctrl(
    bio: *mut ffi::BIO,
    cmd: c_int,
    num: c_long,
    _ptr: *mut c_void,
) -> c_long {
    let Some(state) = (unsafe { shim_state(bio) }) else {
        return 0;
    };
    match cmd {
        BIO_CTRL_GET_CLOSE => state.close_flag.get(),
        BIO_CTRL_SET_CLOSE => {
            state.close_flag.set(num);
            1
        }
        // Nothing is buffered beyond the outbound buffer itself
        ffi::BIO_CTRL_FLUSH => 1,
        _ => 0,
    }
}

unsafe extern "C" fn bbio_create(bio: *mut ffi::BIO) -> c_int {
    // SAFETY: called by BIO_new on a fresh instance.
    unsafe {
        ffi::BIO_set_data(bio, ptr::null_mut());
        ffi::BIO_set_init(bio, 0);
    }
    1
}

unsafe extern "C" fn bbio_destroy(bio: *mut ffi::BIO) -> c_int {
    if bio.is_null() {
        return 0;
    }
    // Release the slot's strong reference if close() has not already.
    // The shim state is host-owned; only the reference goes.
    let data = unsafe { ffi::BIO_get_data(bio) };
    if !data.is_null() {
        unsafe { ffi::BIO_set_data(bio, ptr::null_mut()) };
        // SAFETY: non-null slot values come from Rc::into_raw.
        drop(unsafe { Rc::from_raw(data as *const BioState) });
    }
    1
}
