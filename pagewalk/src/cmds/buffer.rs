// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs::File;
use std::io::Read;

use clap::Parser;
use color_eyre::eyre::{Context, bail};
use pagewalk_core::VirtualAddress;
use pagewalk_core::paging::PAGE_SIZE;

use crate::config::Settings;
use crate::session::Session;
use crate::util::print_flush;

#[derive(Debug, Default, Parser)]
pub struct Cmd {
    /// Print the memory map of this process before translating
    #[clap(long)]
    show_maps: bool,
}

impl Cmd {
    pub fn run(&self, settings: &Settings) -> crate::Result<()> {
        let mut session = Session::open(settings)?;

        // reading the memory map into the buffer makes sure it is backed by a frame
        let mut buff = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let read = File::open("/proc/self/maps")
            .and_then(|mut maps| maps.read(&mut buff))
            .context("failed to read /proc/self/maps")?;

        if self.show_maps {
            print_flush(&String::from_utf8_lossy(&buff[..read]))?;
        }

        let regs = session.control_registers()?;
        print_flush(&format!("CR3 is {:X}\n", regs.cr3))?;

        let virt = VirtualAddress::from_ptr(buff.as_ptr());
        if session
            .translate("buff", regs.top_level_table(), virt)?
            .is_none()
        {
            bail!("could not translate the buffer at {virt}");
        }

        Ok(())
    }
}
