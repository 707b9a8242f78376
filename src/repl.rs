// File: src/repl.rs
//
// Interactive REPL for Ember. One `Vm` lives for the whole session, so a
// `var` or `fn` declared on one line stays visible to every line after it
// -- each line is compiled and run as its own top-level script sharing the
// same globals table. `Ctrl+D`/`Ctrl+C` exit cleanly; a compile error
// prints the normal diagnostic and the prompt comes back.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Self {
        let editor = DefaultEditor::new().expect("failed to initialize line editor");
        Repl { vm: Vm::new(), editor }
    }

    pub fn run(&mut self) {
        println!("{}", "Ember REPL".bright_cyan().bold());
        println!("Ctrl+D to exit.");

        loop {
            match self.editor.readline(&"ember> ".bright_green().to_string()) {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(line.as_str());
                    self.vm.interpret(&line);
                }
                Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
                Err(err) => {
                    eprintln!("Readline error: {err}");
                    break;
                }
            }
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}
