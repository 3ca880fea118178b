//! Diagnostics for the interposition path.
//!
//! Anything printed from inside `malloc` must not allocate, so lines are formatted into a
//! fixed buffer on the stack and handed to `write(2)` directly.  Per-call tracing goes through
//! [`ksmp_debug!`](crate::ksmp_debug), which compiles to nothing without the `debug-log`
//! feature.

use std::fmt;

use libc::c_void;

const PREFIX: &str = "ksm_preload: ";
const LINE_CAPACITY: usize = 256;

/// A line of text that silently truncates once full.
pub struct LineBuffer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    pub const fn new() -> Self {
        LineBuffer {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    // Keeps room for the trailing newline.
    fn push_bytes(&mut self, bytes: &[u8]) {
        let room = LINE_CAPACITY - 1 - self.len;
        let n = bytes.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    fn finish(&mut self) {
        self.buf[self.len] = b'\n';
        self.len += 1;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// Format one prefixed line and write it to stderr.
pub fn write_line(args: fmt::Arguments<'_>) {
    let mut line = format_line(args);
    line.finish();
    let bytes = line.as_bytes();
    // Short writes and errors are dropped: there is nowhere to report them.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            bytes.as_ptr() as *const c_void,
            bytes.len(),
        );
    }
}

fn format_line(args: fmt::Arguments<'_>) -> LineBuffer {
    use fmt::Write;

    let mut line = LineBuffer::new();
    let _ = line.write_str(PREFIX);
    let _ = line.write_fmt(args);
    line
}

/// Print a diagnostic and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    write_line(args);
    unsafe { libc::abort() }
}

/// Trace one operation or decision on stderr (`debug-log` builds only).
#[cfg(feature = "debug-log")]
#[macro_export]
macro_rules! ksmp_debug {
    ($($arg:tt)*) => {
        $crate::log::write_line(format_args!($($arg)*))
    };
}

/// Trace one operation or decision on stderr (`debug-log` builds only).
#[cfg(not(feature = "debug-log"))]
#[macro_export]
macro_rules! ksmp_debug {
    ($($arg:tt)*) => {
        if false {
            $crate::log::write_line(format_args!($($arg)*))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_is_prefixed() {
        let line = format_line(format_args!("malloc ({}) = {:p}", 16, 0x10 as *const u8));
        assert_eq!(line.as_bytes(), b"ksm_preload: malloc (16) = 0x10");
    }

    #[test]
    fn long_lines_are_truncated() {
        let long = "x".repeat(4 * LINE_CAPACITY);
        let mut line = format_line(format_args!("{}", long));
        line.finish();
        assert_eq!(line.as_bytes().len(), LINE_CAPACITY);
        assert_eq!(line.as_bytes().last(), Some(&b'\n'));
    }
}
