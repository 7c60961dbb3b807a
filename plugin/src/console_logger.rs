//! Console messages outside the tables, using the same `(!)` glyph the table
//! cells use for rows needing attention. Diagnostics go to stderr so machine
//! output on stdout stays parseable.

use nu_ansi_term::Color::{Cyan, Red, Yellow};

/// Print an informational line, optionally with a highlighted detail.
pub fn info(message: &str, data: Option<&str>) {
    match data {
        Some(data) => println!("{}: {data}", Cyan.paint(message)),
        None => println!("{}", Cyan.paint(message)),
    }
}

/// Print a warning line for a degraded item.
pub fn warn(message: &str, data: &str) {
    eprintln!("{} {}: {data}", Yellow.paint("(!)"), Yellow.paint(message));
}

/// Print an error line.
pub fn error(message: &str, data: &str) {
    eprintln!("{} {}: {data}", Red.paint("(!)"), Red.paint(message));
}
