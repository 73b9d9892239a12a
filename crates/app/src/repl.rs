//! Line handling for the interactive prompt.

/// What a completed line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Path(String),
    Hush,
    Panic,
    Resume,
    Time,
    Help,
    Quit,
    Unknown(String),
}

/// Joins continued lines (ending in `\`) into one path.
///
/// A blank line flushes whatever has been collected so far.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<String>,
}

impl LineAssembler {
    pub fn push(&mut self, line: &str) -> Option<Input> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return self.flush();
        }
        if self.pending.is_empty() {
            if let Some(command) = line.trim().strip_prefix('.') {
                return Some(dot_command(command));
            }
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                self.pending.push(head.to_string());
                None
            }
            None => {
                self.pending.push(line.to_string());
                self.flush()
            }
        }
    }

    /// Emits the collected lines, if any.
    pub fn flush(&mut self) -> Option<Input> {
        if self.pending.is_empty() {
            return None;
        }
        let path = std::mem::take(&mut self.pending).join("\n");
        Some(Input::Path(path))
    }
}

fn dot_command(command: &str) -> Input {
    match command.trim() {
        "hush" => Input::Hush,
        "panic" => Input::Panic,
        "resume" => Input::Resume,
        "time" => Input::Time,
        "help" | "h" => Input::Help,
        "quit" | "q" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}

pub const HELP: &str = "\
.hush     release every voice and suspend rendering
.panic    silence every voice immediately
.resume   restart rendering after .hush
.time     show the engine clock
.quit     exit
End a line with \\ to continue a path on the next line.";
