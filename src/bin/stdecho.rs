//! Copies standard input to standard output.
//!
//! Exits with 1 and a message on standard error if no input was received.

use std::io::{self, Read, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut input = Vec::new();
    match io::stdin().read_to_end(&mut input) {
        Ok(_) => {}
        // started without a standard input
        Err(e) if e.raw_os_error() == Some(libc::EBADF) => {}
        Err(e) => {
            eprintln!("error reading std input: {e}");
            return ExitCode::from(2);
        }
    }
    if input.is_empty() {
        eprintln!("no data on std input received");
        return ExitCode::from(1);
    }
    let mut stdout = io::stdout().lock();
    if stdout.write_all(&input).and_then(|()| stdout.flush()).is_err() {
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
