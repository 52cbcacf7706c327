use std::io::{self, Write};

use crate::error::OutputError;
use crate::output::Outputs;
use crate::payload::Payload;

/// Writes every payload as one JSON line instead of calling a backend.
pub struct PrintOutput<W> {
    name: &'static str,
    writer: W,
}

impl PrintOutput<io::Stdout> {
    pub fn stdout(name: &'static str) -> Self {
        Self::new(name, io::stdout())
    }
}

impl<W: Write + Send> PrintOutput<W> {
    pub fn new(name: &'static str, writer: W) -> Self {
        Self { name, writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<P: Payload, W: Write + Send> Outputs<P> for PrintOutput<W> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn process_payload(&mut self, payload: &P) -> Result<(), OutputError> {
        serde_json::to_writer(&mut self.writer, payload)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
