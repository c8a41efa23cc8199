//! [`ByteBuf`]-backed BIO for **OpenSSL**
//!
//! An OpenSSL `SSL` object does its I/O through a pluggable byte
//! stream, the BIO.  This crate provides a BIO whose two ends are
//! plain in-memory buffers, so the TLS engine never touches a socket
//! or a timer: the glue code feeds ciphertext that arrived from the
//! network into the shim, drives the engine, and collects the
//! ciphertext the engine wants sent.  This would typically be used to
//! embed OpenSSL into an event loop or a userspace network stack that
//! insists on owning all I/O itself.
//!
//! The buffers are reference-counted with copy-on-write storage, so
//! collecting the accumulated outbound ciphertext is an index
//! operation, not a copy, and the engine can keep writing while the
//! glue code still holds the previous extraction.  Many small engine
//! writes coalesce into one contiguous buffer, one per extraction.
//! Storage retained between extractions can be bounded with a
//! configured maximum so a one-off burst doesn't pin its peak
//! allocation for the life of the connection.
//!
//! # Lifecycle
//!
//! The shim and its BIO reference each other, and OpenSSL may hold
//! additional BIO references for as long as it likes.  Call
//! [`ByteBufBio::close`] (or just drop the shim) when the connection
//! is finished: the BIO is cut loose, any late engine callback fails
//! as a non-retryable error, and the BIO's memory goes when the
//! engine releases its last reference.
//!
//! # Threading
//!
//! The shim is single-threaded by contract as well as by type (it is
//! not `Send`).  Host calls and engine callbacks must all run on the
//! same thread, which is the natural shape when the host drives the
//! engine from its event loop.
//!
//! # Selecting the OpenSSL version
//!
//! This crate talks to OpenSSL through the **openssl-sys** crate and
//! re-exports it as `bytebuf_openssl::openssl_sys`, so a host can
//! call `SSL_set_bio` and friends without adding its own sys
//! dependency.  Anything OpenSSL 1.1.0+ or LibreSSL with the
//! BIO_meth interface will do; see the [**openssl-sys**
//! documentation](https://docs.rs/openssl-sys) for how the library is
//! located at build time.

#![forbid(unsafe_op_in_unsafe_fn)]

pub use openssl_sys;

mod bio;
mod buf;

pub use bio::{ByteBufBio, RetainedBio};
pub use buf::{BufAllocator, ByteBuf};
