//! Renders result rows as `| col | col |` lines with separators, into
//! the session buffer and optionally `output.txt`.

use std::io::Write;

use crate::context::Context;
use crate::errors::DbResult;

const COL_WIDTH: usize = 16;

/// Fixed-width table printer.
pub struct RecordPrinter {
    num_cols: usize,
}

impl RecordPrinter {
    pub fn new(num_cols: usize) -> Self {
        Self { num_cols }
    }

    fn emit(ctx: &mut Context<'_>, line: &str) -> DbResult<()> {
        ctx.output.extend_from_slice(line.as_bytes());
        ctx.output.push(b'\n');
        if ctx.mirror_to_file {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open("output.txt")?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    pub fn print_separator(&self, ctx: &mut Context<'_>) -> DbResult<()> {
        let mut line = String::with_capacity(self.num_cols * (COL_WIDTH + 3) + 1);
        for _ in 0..self.num_cols {
            line.push('+');
            line.push_str(&"-".repeat(COL_WIDTH + 2));
        }
        line.push('+');
        Self::emit(ctx, &line)
    }

    pub fn print_record(&self, values: &[String], ctx: &mut Context<'_>) -> DbResult<()> {
        let mut line = String::with_capacity(self.num_cols * (COL_WIDTH + 3) + 1);
        for value in values {
            line.push_str(&format!("| {value:<COL_WIDTH$} "));
        }
        line.push('|');
        Self::emit(ctx, &line)
    }
}
