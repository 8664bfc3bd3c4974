// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Line-oriented diagnostic shell.
//!
//! The shell is an ordinary unprivileged task. It owns no kernel state and
//! holds no kernel references: every command bottoms out in a supervisor
//! call, reached through the [`SysApi`] trait so the command logic can be
//! exercised on the host against a recording fake. Bytes come and go
//! through the [`Console`] trait, behind which the application hides its
//! UART.
//!
//! Commands (the leading token is case-insensitive):
//!
//! | command | effect |
//! |---|---|
//! | `reboot` | system reset |
//! | `ps` | task table |
//! | `ipcs` | semaphore/mutex status |
//! | `kill <pid>` | kill by decimal pid |
//! | `pkill <name>` | kill by task name |
//! | `pi on\|off` | priority inheritance |
//! | `preempt on\|off` | tick preemption |
//! | `sched prio\|rr` | scheduler selection |
//! | `pidof <name>` | print a task's pid |
//! | `run <name>` | restart a (killed) task |

#![cfg_attr(target_os = "none", no_std)]

use abi::Pid;
use core::fmt::Write as _;

/// Byte console the shell runs over. `getc` is non-blocking; the shell
/// yields between polls so an idle prompt costs nothing.
pub trait Console {
    fn getc(&mut self) -> Option<u8>;
    fn putc(&mut self, byte: u8);

    fn puts(&mut self, s: &str) {
        for &b in s.as_bytes() {
            self.putc(b);
        }
    }
}

/// The kernel services the shell needs, one method per supervisor call it
/// issues. `userlib`-backed in a real system; a recording fake in tests.
pub trait SysApi {
    fn yield_now(&mut self);
    fn ps(&mut self);
    fn ipcs(&mut self);
    fn kill(&mut self, pid: Pid);
    fn restart(&mut self, pid: Pid);
    fn pidof(&mut self, name: &str) -> Pid;
    fn reboot(&mut self);
    fn set_priority_inheritance(&mut self, on: bool);
    fn set_preemption(&mut self, on: bool);
    fn set_priority_scheduler(&mut self, on: bool);
}

/// [`SysApi`] implemented over the real supervisor-call stubs.
#[derive(Default)]
pub struct UserApi;

impl SysApi for UserApi {
    fn yield_now(&mut self) {
        userlib::sys_yield()
    }
    fn ps(&mut self) {
        userlib::ps()
    }
    fn ipcs(&mut self) {
        userlib::ipcs()
    }
    fn kill(&mut self, pid: Pid) {
        userlib::kill(pid)
    }
    fn restart(&mut self, pid: Pid) {
        userlib::restart(pid)
    }
    fn pidof(&mut self, name: &str) -> Pid {
        userlib::pidof(name)
    }
    fn reboot(&mut self) {
        userlib::reboot()
    }
    fn set_priority_inheritance(&mut self, on: bool) {
        userlib::set_priority_inheritance(on)
    }
    fn set_preemption(&mut self, on: bool) {
        userlib::set_preemption(on)
    }
    fn set_priority_scheduler(&mut self, on: bool) {
        userlib::set_priority_scheduler(on)
    }
}

const MAX_LINE: usize = 80;
const MAX_FIELDS: usize = 5;

/// A parsed token: its text and whether it lexed as a number.
#[derive(Debug, Copy, Clone)]
struct Field<'a> {
    text: &'a str,
    numeric: bool,
}

/// Splits a line into up to [`MAX_FIELDS`] fields. Field characters are
/// alphanumerics plus `-` and `.`; everything else separates. A field's
/// type comes from its first character.
fn parse_fields(line: &str) -> heapless::Vec<Field<'_>, MAX_FIELDS> {
    let mut fields = heapless::Vec::new();
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() && !fields.is_full() {
        let is_field = |b: u8| b.is_ascii_alphanumeric() || b == b'-' || b == b'.';
        if !is_field(bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && is_field(bytes[i]) {
            i += 1;
        }
        let first = bytes[start];
        let _ = fields.push(Field {
            text: &line[start..i],
            numeric: first.is_ascii_digit() || first == b'-' || first == b'.',
        });
    }
    fields
}

pub struct Shell<C, S> {
    console: C,
    sys: S,
    line: heapless::Vec<u8, MAX_LINE>,
}

impl<C: Console, S: SysApi> Shell<C, S> {
    pub fn new(console: C, sys: S) -> Self {
        Self {
            console,
            sys,
            line: heapless::Vec::new(),
        }
    }

    /// The shell task body: prompt, edit, execute, forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.console.puts("\n> ");
            self.read_line();
            self.execute_line();
        }
    }

    /// Collects one line with echo and backspace editing, yielding while
    /// the console has nothing for us.
    fn read_line(&mut self) {
        self.line.clear();
        loop {
            let Some(c) = self.console.getc() else {
                self.sys.yield_now();
                continue;
            };
            match c {
                // Backspace or DEL rubs out the last character.
                8 | 127 => {
                    if self.line.pop().is_some() {
                        self.console.puts("\u{8} \u{8}");
                    }
                }
                b'\r' => {
                    self.console.putc(b'\n');
                    return;
                }
                c if (32..127).contains(&c) && !self.line.is_full() => {
                    self.line.push(c).ok();
                    self.console.putc(c);
                }
                _ => {}
            }
        }
    }

    fn execute_line(&mut self) {
        // The editor admits only printable ASCII, so this cannot fail.
        let line = core::str::from_utf8(&self.line).unwrap_or("");
        let fields = parse_fields(line);
        let Some(cmd) = fields.first().filter(|f| !f.numeric) else {
            return;
        };

        let arg = fields.get(1).copied();
        let is = |name: &str| cmd.text.eq_ignore_ascii_case(name);

        if is("reboot") {
            self.console.puts("reboot\n");
            self.sys.reboot();
        } else if is("ps") {
            self.sys.ps();
        } else if is("ipcs") {
            self.sys.ipcs();
        } else if is("kill") {
            if let Some(arg) = arg {
                let pid = if arg.numeric {
                    arg.text.parse::<u32>().unwrap_or(0)
                } else {
                    0
                };
                if pid == 0 {
                    self.console.puts("invalid pid\n");
                } else {
                    self.sys.kill(Pid(pid));
                }
            }
        } else if is("pkill") {
            if let Some(arg) = arg {
                match lookup(&mut self.console, &mut self.sys, arg.text) {
                    Some(pid) => self.sys.kill(pid),
                    None => {}
                }
            }
        } else if is("pi") {
            if let Some(on) = arg.and_then(|a| parse_on_off(a.text)) {
                self.sys.set_priority_inheritance(on);
            }
        } else if is("preempt") {
            if let Some(on) = arg.and_then(|a| parse_on_off(a.text)) {
                self.sys.set_preemption(on);
            }
        } else if is("sched") {
            match arg.map(|a| a.text.as_bytes()[0].to_ascii_lowercase()) {
                Some(b'p') => self.sys.set_priority_scheduler(true),
                Some(b'r') => self.sys.set_priority_scheduler(false),
                _ => {}
            }
        } else if is("pidof") {
            if let Some(arg) = arg {
                let pid = self.sys.pidof(arg.text);
                let mut out = ConsoleWriter(&mut self.console);
                let _ = write!(out, "PID of {}: {}\n", arg.text, pid.0);
            }
        } else if is("run") {
            if let Some(arg) = arg {
                match lookup(&mut self.console, &mut self.sys, arg.text) {
                    Some(pid) => self.sys.restart(pid),
                    None => {}
                }
            }
        }
    }
}

/// Name -> pid with the standard complaint on failure. Free-standing so the
/// name may keep borrowing the line buffer while the console and services
/// are in play.
fn lookup<C: Console, S: SysApi>(
    console: &mut C,
    sys: &mut S,
    name: &str,
) -> Option<Pid> {
    let pid = sys.pidof(name);
    if pid.is_none() {
        console.puts("no such task: ");
        console.puts(name);
        console.putc(b'\n');
        None
    } else {
        Some(pid)
    }
}

struct ConsoleWriter<'a, C>(&'a mut C);

impl<C: Console> core::fmt::Write for ConsoleWriter<'_, C> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.puts(s);
        Ok(())
    }
}

fn parse_on_off(arg: &str) -> Option<bool> {
    if arg.eq_ignore_ascii_case("on") {
        Some(true)
    } else if arg.eq_ignore_ascii_case("off") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::string::String;
    use std::vec::Vec;

    #[derive(Default)]
    struct ScriptConsole {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl ScriptConsole {
        fn scripted(s: &str) -> Self {
            Self {
                input: s.bytes().collect(),
                output: Vec::new(),
            }
        }

        fn output(&self) -> String {
            String::from_utf8(self.output.clone()).unwrap()
        }
    }

    impl Console for ScriptConsole {
        fn getc(&mut self) -> Option<u8> {
            Some(self.input.pop_front().expect("script exhausted"))
        }
        fn putc(&mut self, byte: u8) {
            self.output.push(byte);
        }
    }

    #[derive(Debug, PartialEq)]
    enum Call {
        Ps,
        Ipcs,
        Kill(u32),
        Restart(u32),
        Pidof(String),
        Reboot,
        Pi(bool),
        Preempt(bool),
        Sched(bool),
    }

    #[derive(Default)]
    struct MockSys {
        calls: Vec<Call>,
        /// name -> pid table consulted by `pidof`.
        tasks: Vec<(String, u32)>,
    }

    impl SysApi for MockSys {
        fn yield_now(&mut self) {}
        fn ps(&mut self) {
            self.calls.push(Call::Ps);
        }
        fn ipcs(&mut self) {
            self.calls.push(Call::Ipcs);
        }
        fn kill(&mut self, pid: Pid) {
            self.calls.push(Call::Kill(pid.0));
        }
        fn restart(&mut self, pid: Pid) {
            self.calls.push(Call::Restart(pid.0));
        }
        fn pidof(&mut self, name: &str) -> Pid {
            self.calls.push(Call::Pidof(name.into()));
            let pid = self
                .tasks
                .iter()
                .find(|(n, _)| n == name)
                .map(|&(_, p)| p)
                .unwrap_or(0);
            Pid(pid)
        }
        fn reboot(&mut self) {
            self.calls.push(Call::Reboot);
        }
        fn set_priority_inheritance(&mut self, on: bool) {
            self.calls.push(Call::Pi(on));
        }
        fn set_preemption(&mut self, on: bool) {
            self.calls.push(Call::Preempt(on));
        }
        fn set_priority_scheduler(&mut self, on: bool) {
            self.calls.push(Call::Sched(on));
        }
    }

    fn run_line(line: &str, sys: MockSys) -> (ScriptConsole, MockSys) {
        let mut script = String::from(line);
        script.push('\r');
        let mut shell = Shell::new(ScriptConsole::scripted(&script), sys);
        shell.read_line();
        shell.execute_line();
        (shell.console, shell.sys)
    }

    #[test]
    fn input_is_echoed() {
        let (console, _) = run_line("ps", MockSys::default());
        assert_eq!(console.output(), "ps\n");
    }

    #[test]
    fn backspace_edits_the_line() {
        let (console, sys) = run_line("pss\u{7f}", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Ps]);
        assert!(console.output().contains("\u{8} \u{8}"));
    }

    #[test]
    fn commands_are_case_insensitive() {
        let (_, sys) = run_line("IPCS", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Ipcs]);
    }

    #[test]
    fn kill_takes_a_decimal_pid() {
        let (_, sys) = run_line("kill 9219", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Kill(9219)]);
    }

    #[test]
    fn kill_zero_is_rejected_client_side() {
        let (console, sys) = run_line("kill 0", MockSys::default());
        assert!(sys.calls.is_empty());
        assert!(console.output().contains("invalid pid\n"));
    }

    #[test]
    fn kill_without_args_does_nothing() {
        let (_, sys) = run_line("kill", MockSys::default());
        assert!(sys.calls.is_empty());
    }

    #[test]
    fn pkill_resolves_the_name_first() {
        let mut sys = MockSys::default();
        sys.tasks.push(("worker".into(), 0x4001));
        let (_, sys) = run_line("pkill worker", sys);
        assert_eq!(
            sys.calls,
            vec![Call::Pidof("worker".into()), Call::Kill(0x4001)]
        );
    }

    #[test]
    fn pkill_unknown_name_complains() {
        let (console, sys) = run_line("pkill ghost", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Pidof("ghost".into())]);
        assert!(console.output().contains("no such task: ghost\n"));
    }

    #[test]
    fn pidof_prints_the_result() {
        let mut sys = MockSys::default();
        sys.tasks.push(("idle".into(), 77));
        let (console, _) = run_line("pidof idle", sys);
        assert!(console.output().contains("PID of idle: 77\n"));
    }

    #[test]
    fn run_restarts_by_name() {
        let mut sys = MockSys::default();
        sys.tasks.push(("flash".into(), 5150));
        let (_, sys) = run_line("run flash", sys);
        assert_eq!(
            sys.calls,
            vec![Call::Pidof("flash".into()), Call::Restart(5150)]
        );
    }

    #[test]
    fn mode_toggles() {
        let (_, sys) = run_line("pi on", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Pi(true)]);
        let (_, sys) = run_line("PREEMPT OFF", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Preempt(false)]);
        let (_, sys) = run_line("sched prio", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Sched(true)]);
        let (_, sys) = run_line("sched rr", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Sched(false)]);
    }

    #[test]
    fn reboot_announces_itself() {
        let (console, sys) = run_line("reboot", MockSys::default());
        assert_eq!(sys.calls, vec![Call::Reboot]);
        assert!(console.output().contains("reboot\n"));
    }

    #[test]
    fn unknown_commands_are_ignored() {
        let (_, sys) = run_line("frobnicate 12", MockSys::default());
        assert!(sys.calls.is_empty());
    }

    #[test]
    fn numeric_leading_token_is_not_a_command() {
        let (_, sys) = run_line("42 ps", MockSys::default());
        assert!(sys.calls.is_empty());
    }

    #[test]
    fn fields_split_on_punctuation() {
        let fields = parse_fields("kill   1234");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].text, "kill");
        assert!(!fields[0].numeric);
        assert_eq!(fields[1].text, "1234");
        assert!(fields[1].numeric);
    }
}
