//! "Library" functions user code can `extern`.

use std::io::{self, Write};

pub(crate) const PUTCHARD: &str = "putchard";
pub(crate) const PRINTD: &str = "printd";

/// Writes the character whose code point is `x`.
pub(crate) fn putchard<W: Write + ?Sized>(out: &mut W, x: f64) -> io::Result<f64> {
    let c = std::char::from_u32(x as u32).unwrap_or(std::char::REPLACEMENT_CHARACTER);
    write!(out, "{}", c)?;
    out.flush()?;
    Ok(0.0)
}

/// Writes `x` followed by a newline.
pub(crate) fn printd<W: Write + ?Sized>(out: &mut W, x: f64) -> io::Result<f64> {
    writeln!(out, "{:.6}", x)?;
    Ok(0.0)
}

/// Entry points handed to native code, writing to stderr.
#[cfg(feature = "llvm")]
pub(crate) mod native {
    use libc::c_double;
    use std::io::stderr;

    #[no_mangle]
    pub extern "C" fn putchard(x: c_double) -> c_double {
        super::putchard(&mut stderr(), x).unwrap_or(0.0)
    }

    #[no_mangle]
    pub extern "C" fn printd(x: c_double) -> c_double {
        super::printd(&mut stderr(), x).unwrap_or(0.0)
    }
}

#[cfg(test)]
pub(crate) use self::test::SharedBuffer;
