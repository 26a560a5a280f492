// SPDX-License-Identifier: MIT
//! Local port allocation for worker subprocesses.
//!
//! A worker is always given a fresh loopback port to bind. We don't hold
//! the socket open for the worker — there's an inherent TOCTOU race between
//! allocating the port here and the subprocess binding it, which callers
//! handle by retrying the whole spawn on failure (see `supervisor`).

use std::io;
use std::net::TcpListener;

/// Ask the OS for an unused TCP port on `127.0.0.1` and hand it back.
///
/// The listener is dropped immediately after reading back its local address,
/// so no ownership of the port is retained by this process.
pub fn allocate() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_ports() {
        let a = allocate().unwrap();
        let b = allocate().unwrap();
        // Not strictly guaranteed distinct under extreme reuse, but on a
        // freshly booted test runner the kernel won't hand back the same
        // ephemeral port twice in a row.
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }
}
