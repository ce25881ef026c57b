// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use clap::Parser;
use color_eyre::eyre::ensure;
use pagewalk_core::VirtualAddress;

use crate::config::Settings;
use crate::session::Session;
use crate::util::parse_address;

#[derive(Debug, Parser)]
pub struct Cmd {
    /// Virtual addresses to translate, in hexadecimal
    #[clap(required = true, value_parser = parse_address)]
    addresses: Vec<VirtualAddress>,
}

impl Cmd {
    #[cfg(test)]
    pub fn addresses(&self) -> &[VirtualAddress] {
        &self.addresses
    }

    pub fn run(&self, settings: &Settings) -> crate::Result<()> {
        let mut session = Session::open(settings)?;

        let regs = session.control_registers()?;
        let top_level = regs.top_level_table();
        log::info!("CR3 is {:X}", regs.cr3);

        let mut failed = 0;
        for virt in &self.addresses {
            if session.translate("translate", top_level, *virt)?.is_none() {
                failed += 1;
            }
        }

        ensure!(
            failed == 0,
            "{failed} of {} translations failed",
            self.addresses.len()
        );

        Ok(())
    }
}
