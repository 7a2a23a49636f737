pub use anyhow::Context;
pub use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints an error the way a linker is expected to and terminates with a
/// non-zero status. Used by the binary; library callers get the `Result`.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("tern: error: {error:#}");
    std::process::exit(1);
}
