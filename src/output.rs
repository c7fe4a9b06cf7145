//! Shared output formatting for the CLI commands.
//!
//! JSONL and CSV rows stream as they are produced; tables buffer in memory
//! and render when the command finishes.

use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write the output to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match &self.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { table }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv,
        };
        Ok(Output { path: self.output, io, formatter })
    }
}

pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Table { table: comfy_table::Table },
    Jsonl,
    Csv,
}

impl Output {
    /// Column names. Must come before the first row; JSONL records carry
    /// their own field names and ignore this.
    pub fn headers(&mut self, names: &[&'static str]) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Table { table } => {
                table.set_header(names.to_vec());
                Ok(())
            }
            Formatter::Jsonl => Ok(()),
            Formatter::Csv => {
                let cells = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
                self.write_csv_record(&cells)
            }
        }
    }

    /// Emit one result row. The closures keep formatting lazy so only the
    /// selected representation is ever built.
    pub fn row<R: serde::Serialize>(
        &mut self,
        cells: impl FnOnce() -> Vec<String>,
        record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Table { table } => {
                table.add_row(cells());
                Ok(())
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &record()).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?;
                self.io.flush().map_err(|e| self.write_error(e))
            }
            Formatter::Csv => {
                let cells = cells();
                self.write_csv_record(&cells)
            }
        }
    }

    fn write_csv_record(&mut self, cells: &[String]) -> Result<(), Error> {
        let longest = cells.iter().map(|c| c.len()).max().unwrap_or(0);
        // Quoting at worst doubles a field, plus the surrounding quotes.
        let mut buffer = vec![0; 2 * longest + 2];
        let mut writer = csv_core::Writer::new();
        for cell in cells {
            let (result, consumed, written) = writer.field(cell.as_bytes(), &mut buffer);
            let WriteResult::InputEmpty = result else {
                unreachable!("csv buffer sized for the longest field");
            };
            debug_assert_eq!(consumed, cell.len());
            self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))?;
            let (WriteResult::InputEmpty, written) = writer.delimiter(&mut buffer) else {
                unreachable!("csv delimiter does not fit");
            };
            self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, written) = writer.terminator(&mut buffer) else {
            unreachable!("csv terminator does not fit");
        };
        self.io.write_all(&buffer[..written]).map_err(|e| self.write_error(e))?;
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    /// Flush everything out; renders the buffered table.
    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { table } = &self.formatter {
            writeln!(self.io, "{table}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}
