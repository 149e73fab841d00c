// Print macros for kernel output

use core::fmt;

#[doc(hidden)]
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    crate::serial::_print(args);
}

// Host builds route kernel output to stdout so tests can observe it.
#[doc(hidden)]
#[cfg(not(target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
    use std::io::Write;
    let _ = std::io::stdout().write_fmt(args);
}

#[doc(hidden)]
#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
pub fn _print(_args: fmt::Arguments) {}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
