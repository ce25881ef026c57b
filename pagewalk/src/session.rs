// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs::File;

use color_eyre::Help;
use color_eyre::eyre::Context;
use pagewalk_core::procfs::{PhysicalMemoryFile, ProcControlRegisters};
use pagewalk_core::{
    ControlRegisters, DumpFilter, PhysicalAddress, Transcript, Translation, VirtualAddress, Walker,
};

use crate::config::Settings;
use crate::util::print_flush;

const MODULE_HINT: &str = "the files are provided by the `cr3` kernel module, is it loaded?";

/// The two privileged collaborators plus the walker, shared by all commands.
pub struct Session {
    control_registers: ProcControlRegisters,
    walker: Walker<PhysicalMemoryFile<File>>,
    dump: DumpFilter,
}

impl Session {
    /// Opens the physical memory reader. Failing to do so is fatal.
    pub fn open(settings: &Settings) -> crate::Result<Self> {
        let memory = PhysicalMemoryFile::open(&settings.phys_mem_path)
            .wrap_err("cannot read physical memory")
            .suggestion(MODULE_HINT)
            .note("reading physical memory requires root privileges")?;

        log::debug!(
            "reading physical memory from {}",
            settings.phys_mem_path.display()
        );

        Ok(Self {
            control_registers: ProcControlRegisters::new(&settings.cr3_path),
            walker: Walker::new(memory),
            dump: settings.dump,
        })
    }

    /// Reads the control registers of the calling process.
    ///
    /// The record is re-read on every call, the two sides of a fork see different values.
    pub fn control_registers(&self) -> crate::Result<ControlRegisters> {
        let regs = self
            .control_registers
            .read()
            .wrap_err("cannot acquire the top-level page table address")
            .suggestion(MODULE_HINT)?;

        if let Some(cr4) = regs.cr4 {
            log::debug!("CR4={cr4:016X} PAE={:?} PSE={:?}", regs.pae, regs.pse);
        }

        Ok(regs)
    }

    /// Translates `virt` starting at `top_level`, printing the transcript labelled `label` to
    /// stdout.
    ///
    /// Returns `Ok(None)` when the translation failed in a way that only affects this address,
    /// e.g. a short table read. Every other error is returned.
    pub fn translate(
        &mut self,
        label: &str,
        top_level: PhysicalAddress,
        virt: VirtualAddress,
    ) -> crate::Result<Option<Translation>> {
        let mut transcript = Transcript::new(label, self.dump);
        let res = self.walker.translate(top_level, virt, &mut transcript);

        print_flush(&transcript.take()).context("failed to write transcript")?;

        match res {
            Ok(translation) => Ok(Some(translation)),
            Err(err) if !err.is_fatal() => {
                log::warn!("could not translate {virt}: {err}");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}
