// File: src/repl.rs
//
// Interactive REPL. Rewired from the teacher's tree-walking-interpreter
// shell onto the lexer -> parser -> compiler -> VM pipeline: one `Vm`
// persists for the whole session, so globals and function/class
// declarations from earlier inputs stay visible to later ones (each
// submission compiles to its own top-level script function, but they all
// share the same `Vm::globals` map and heap).
//
// Unlike the tree-walking REPL, a bare expression statement's value is not
// auto-printed here -- the compiler always pops an expression statement's
// result (spec.md's stack-balance invariant), and there's no special "last
// value" slot in the VM to read it back out after the frame unwinds.
// Use `print(...)` to see a value, same as in a script.

use crate::lexer;
use crate::parser::Parser;
use crate::vm::Vm;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "Ruff REPL".bright_cyan().bold());
        println!(
            "  {} {}{}{}",
            "Type".bright_blue(),
            ":help".bright_yellow(),
            " for commands, ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt =
                if buffer.is_empty() { "ruff> ".bright_green().to_string() } else { "....> ".bright_blue().to_string() };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if Self::is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Returns true to keep the REPL running, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":vars" | ":v" => {
                self.show_globals();
                true
            }
            ":reset" | ":r" => {
                self.vm = Vm::new();
                println!("{}", "environment reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} unknown command '{}', try {}",
                    "error:".bright_red(),
                    cmd.bright_yellow(),
                    ":help".bright_yellow()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "Commands:".bright_cyan().bold());
        println!("  {}  show this help", ":help, :h".bright_yellow());
        println!("  {}  exit the REPL", ":quit, :q".bright_yellow());
        println!("  {}  clear the screen", ":clear, :c".bright_yellow());
        println!("  {}  list global names", ":vars, :v".bright_yellow());
        println!("  {}  reset all state", ":reset, :r".bright_yellow());
        println!();
        println!("Leave a brace/paren unclosed to continue on the next line.");
        println!();
    }

    fn show_globals(&self) {
        let mut names = self.vm.global_names();
        names.sort();
        println!();
        println!("{}", "Globals:".bright_cyan().bold());
        for name in names {
            println!("  {}", name);
        }
        println!();
    }

    /// True once every brace/bracket/paren opened in `input` is closed and
    /// we aren't mid-string -- the same bracket-balance heuristic the
    /// teacher's REPL used for deciding when a multi-line block is done.
    fn is_input_complete(input: &str) -> bool {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return true;
        }

        let mut depth = 0i32;
        let mut in_string = false;
        let mut escape_next = false;
        let mut in_comment = false;

        for ch in trimmed.chars() {
            if in_comment {
                if ch == '\n' {
                    in_comment = false;
                }
                continue;
            }
            if escape_next {
                escape_next = false;
                continue;
            }
            match ch {
                '\\' if in_string => escape_next = true,
                '"' => in_string = !in_string,
                '#' if !in_string => in_comment = true,
                '{' | '(' if !in_string => depth += 1,
                '}' | ')' if !in_string => depth -= 1,
                _ => {}
            }
        }

        !in_string && depth <= 0
    }

    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }
        let tokens = lexer::tokenize(input);
        let program = Parser::new(tokens).parse();
        if let Err(err) = self.vm.interpret(&program) {
            println!("{} {}", "error:".bright_red().bold(), err);
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to create REPL")
    }
}
