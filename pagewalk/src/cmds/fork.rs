// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shows copy-on-write in action.
//!
//! Right after the fork both processes translate the data region to the same frame, its leaf
//! entry now write protected. Once the child writes, it gets a private copy of the frame while
//! the parent keeps the original.

use std::time::Duration;
use std::{fmt, io, process, thread};

use clap::Parser;
use color_eyre::eyre::{Context, ensure};
use pagewalk_core::VirtualAddress;

use crate::config::Settings;
use crate::region::AnonymousRegion;
use crate::session::Session;
use crate::util::{parse_secs, print_flush};

/// Large enough for the allocation to get its own mapping.
const DATA_LEN: usize = 1024 * 1024;

#[derive(Debug, Parser)]
pub struct Cmd {
    /// Seconds the child waits before its first translation, so output doesn't interleave
    /// [default: 1]
    #[clap(long, value_parser = parse_secs)]
    child_delay: Option<Duration>,

    /// Seconds the parent waits for the child to write before translating again [default: 3]
    #[clap(long, value_parser = parse_secs)]
    parent_delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
enum Branch {
    Parent { child: libc::pid_t },
    Child,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Parent { .. } => f.write_str("parent"),
            Branch::Child => f.write_str("child"),
        }
    }
}

impl Cmd {
    pub fn run(&self, settings: &Settings) -> crate::Result<()> {
        let child_delay = self.child_delay.unwrap_or(settings.child_delay);
        let parent_delay = self.parent_delay.unwrap_or(settings.parent_delay);

        // inherited by the child, reads are positioned so the shared file offset is never used
        let mut session = Session::open(settings)?;

        let mut data = AnonymousRegion::new(DATA_LEN).context("failed to map data region")?;
        data.write_str("original data");
        let virt = data.address();

        report(&mut session, "orig", virt)?;

        print_flush("--- forking ----\n")?;
        let branch = fork()?;

        if let Branch::Child = branch {
            thread::sleep(child_delay);
        }

        // the leaf entry is write protected in both processes now
        report(&mut session, &branch.to_string(), virt)?;

        match branch {
            Branch::Child => {
                print_flush("--- changing data in child ---\n")?;
                data.write_str("new data");
            }
            Branch::Parent { .. } => thread::sleep(parent_delay),
        }

        report(&mut session, &branch.to_string(), virt)?;
        log::debug!(pid = process::id(); "{branch} sees {:?}", data.read_str());

        if let Branch::Parent { child } = branch {
            wait_for(child)?;
        }

        Ok(())
    }
}

/// Re-acquires CR3, which differs between parent and child, and translates `virt`.
fn report(session: &mut Session, prefix: &str, virt: VirtualAddress) -> crate::Result<()> {
    let regs = session.control_registers()?;
    print_flush(&format!("{prefix}: CR3 is {:X}\n", regs.cr3))?;

    if let Some(translation) = session.translate("data", regs.top_level_table(), virt)? {
        log::debug!(
            pid = process::id();
            "{prefix}: {virt} -> {}",
            translation.physical_address()
        );
    }

    Ok(())
}

fn fork() -> crate::Result<Branch> {
    // Safety: the process is single threaded, the child continues with a copy of this one
    let pid = unsafe { libc::fork() };

    match pid {
        0 => Ok(Branch::Child),
        child if child > 0 => {
            log::debug!(pid = process::id(); "forked child {child}");
            Ok(Branch::Parent { child })
        }
        _ => Err(io::Error::last_os_error()).context("fork failed"),
    }
}

fn wait_for(child: libc::pid_t) -> crate::Result<()> {
    let mut status = 0;

    loop {
        // Safety: `child` is a child of this process and `status` a valid out pointer
        let ret = unsafe { libc::waitpid(child, &raw mut status, 0) };
        if ret == child {
            break;
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err).context("waiting for the child failed");
        }
    }

    ensure!(
        libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
        "child exited with status {status:#x}"
    );

    Ok(())
}
