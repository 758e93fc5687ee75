//! In-memory executor that simulates the loop table and the mount table.

use super::{Cmd, CommandExecutor, CommandOutput};
use crate::signal::Interrupt;
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::io;

pub(crate) const FAKE_LOOP: &str = "/dev/loop7";

enum Scripted {
    Output(CommandOutput),
    SpawnError,
}

/// Records every command and answers `losetup`, `mount`, `umount` and
/// `mountpoint` against simulated kernel state.
#[derive(Default)]
pub(crate) struct FakeExecutor {
    calls: RefCell<Vec<String>>,
    mounted: RefCell<BTreeSet<String>>,
    loops: RefCell<BTreeSet<String>>,
    scripted: RefCell<Vec<(String, Scripted)>>,
    foreground_code: Cell<i32>,
    interrupts: RefCell<Vec<(String, Interrupt)>>,
}

impl FakeExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Any command whose rendered form starts with `prefix` exits with 32.
    pub(crate) fn fail_on(&self, prefix: &str, stderr: &str) {
        self.respond(
            prefix,
            CommandOutput {
                code: 32,
                stderr: stderr.to_string(),
                ..Default::default()
            },
        );
    }

    /// Any command whose rendered form starts with `prefix` can't be spawned.
    pub(crate) fn spawn_error_on(&self, prefix: &str) {
        self.scripted
            .borrow_mut()
            .push((prefix.to_string(), Scripted::SpawnError));
    }

    pub(crate) fn respond(&self, prefix: &str, output: CommandOutput) {
        self.scripted
            .borrow_mut()
            .push((prefix.to_string(), Scripted::Output(output)));
    }

    /// Trigger `interrupt` when a command starting with `prefix` runs, as if
    /// the user pressed Ctrl-C while it was in progress.
    pub(crate) fn interrupt_on(&self, prefix: &str, interrupt: &Interrupt) {
        self.interrupts
            .borrow_mut()
            .push((prefix.to_string(), interrupt.clone()));
    }

    pub(crate) fn set_foreground_code(&self, code: i32) {
        self.foreground_code.set(code);
    }

    /// Pretend something outside this run mounted `target`.
    pub(crate) fn premount(&self, target: &str) {
        self.mounted.borrow_mut().insert(target.to_string());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Calls of one program, in order.
    pub(crate) fn calls_to(&self, program: &str) -> Vec<String> {
        let prefix = format!("{program} ");
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(&prefix) || *c == program)
            .cloned()
            .collect()
    }

    pub(crate) fn mounted(&self) -> Vec<String> {
        self.mounted.borrow().iter().cloned().collect()
    }

    pub(crate) fn attached_loops(&self) -> Vec<String> {
        self.loops.borrow().iter().cloned().collect()
    }

    fn dispatch(&self, cmd: &Cmd) -> io::Result<CommandOutput> {
        let line = cmd.to_string();
        self.calls.borrow_mut().push(line.clone());

        for (prefix, interrupt) in self.interrupts.borrow().iter() {
            if line.starts_with(prefix.as_str()) {
                interrupt.trigger();
            }
        }

        for (prefix, scripted) in self.scripted.borrow().iter() {
            if line.starts_with(prefix.as_str()) {
                return match scripted {
                    Scripted::Output(out) => Ok(out.clone()),
                    Scripted::SpawnError => Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} not found", cmd.program()),
                    )),
                };
            }
        }

        let args = cmd.get_args();
        let last = args.last().cloned().unwrap_or_default();
        let ok = |stdout: &str| -> io::Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            })
        };
        let fail = |stderr: &str| -> io::Result<CommandOutput> {
            Ok(CommandOutput {
                code: 32,
                stderr: stderr.to_string(),
                ..Default::default()
            })
        };

        match cmd.program() {
            "losetup" if args.iter().any(|a| a == "-d") => {
                if self.loops.borrow_mut().remove(&last) {
                    ok("")
                } else {
                    fail(&format!("losetup: {last}: detach failed: No such device or address"))
                }
            }
            "losetup" => {
                self.loops.borrow_mut().insert(FAKE_LOOP.to_string());
                ok(&format!("{FAKE_LOOP}\n"))
            }
            "mount" => {
                self.mounted.borrow_mut().insert(last);
                ok("")
            }
            "umount" => {
                if self.mounted.borrow_mut().remove(&last) {
                    ok("")
                } else {
                    fail(&format!("umount: {last}: not mounted."))
                }
            }
            "mountpoint" => {
                if self.mounted.borrow().contains(&last) {
                    ok(&format!("{last} is a mountpoint\n"))
                } else {
                    fail(&format!("{last} is not a mountpoint"))
                }
            }
            _ => ok(""),
        }
    }
}

impl CommandExecutor for FakeExecutor {
    fn output(&self, cmd: &Cmd) -> io::Result<CommandOutput> {
        self.dispatch(cmd)
    }

    fn foreground(&self, cmd: &Cmd) -> io::Result<CommandOutput> {
        let out = self.dispatch(cmd)?;
        if out.success() {
            return Ok(CommandOutput {
                code: self.foreground_code.get(),
                ..Default::default()
            });
        }
        Ok(out)
    }
}
