// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end session sequencing.
//!
//! [`System`] wraps one [`KernelCore`] and sequences a program's life:
//! create the process, configure it from metadata, let the loader populate
//! it, start the main thread, and on success make it the current process.
//! A failure anywhere in that chain tears the session down through the same
//! shutdown path normal termination uses, so no half-initialized state
//! survives.

use std::sync::Arc;

use crate::{
    kernel::{KernelConfig, KernelCore, Process},
    loader::ProgramLoader,
    Result,
};

/// Tuning knobs for a [`System`] session.
#[derive(Debug, Default, Clone)]
pub struct SystemConfig {
    /// Seed for per-process entropy; see
    /// [`KernelConfig::rng_seed`](crate::kernel::KernelConfig).
    pub rng_seed: Option<u64>,
}

/// One emulation session.
///
/// # Example
///
/// ```rust,no_run
/// use nxkernel::loader::ProgramLoader;
/// use nxkernel::system::{System, SystemConfig};
///
/// fn start(loader: &mut dyn ProgramLoader) -> nxkernel::Result<()> {
///     let system = System::new(SystemConfig::default());
///     let process = system.load("application", loader)?;
///     println!("started process {}", process.process_id());
///     system.shutdown();
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct System {
    kernel: KernelCore,
}

impl System {
    /// Creates a session with a fresh kernel.
    #[must_use]
    pub fn new(config: SystemConfig) -> Self {
        System {
            kernel: KernelCore::new(KernelConfig {
                rng_seed: config.rng_seed,
            }),
        }
    }

    /// Returns the session's kernel.
    #[must_use]
    pub fn kernel(&self) -> &KernelCore {
        &self.kernel
    }

    /// Loads a program into a new process and starts it.
    ///
    /// On success the process is running, its main thread is ready, and it
    /// has been made the session's current process.
    ///
    /// # Errors
    ///
    /// Propagates metadata, capability, mapping, and thread creation errors.
    /// On any failure the whole session is shut down before the error is
    /// returned.
    pub fn load(
        &self,
        name: impl Into<String>,
        loader: &mut dyn ProgramLoader,
    ) -> Result<Arc<Process>> {
        let process = Process::create(&self.kernel, name);

        match self.load_inner(loader, &process) {
            Ok(()) => {
                self.kernel.make_current_process(Arc::clone(&process));
                Ok(process)
            }
            Err(error) => {
                log::error!("failed to load program: {error}");
                self.shutdown();
                Err(error)
            }
        }
    }

    /// Shuts the session down, stopping all threads and dropping all
    /// processes.
    pub fn shutdown(&self) {
        self.kernel.shutdown();
    }

    fn load_inner(&self, loader: &mut dyn ProgramLoader, process: &Arc<Process>) -> Result<()> {
        let metadata = loader.metadata()?;
        process.load_from_metadata(&metadata)?;

        let parameters = loader.load(&self.kernel, process)?;
        process.run(
            &self.kernel,
            parameters.main_thread_priority,
            parameters.main_thread_stack_size,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernel::ProcessStatus,
        loader::{CodeSet, LoadParameters, ProgramMetadata},
        Error,
    };

    /// Loader producing a single page of code with default metadata.
    struct FixedLoader {
        fail_metadata: bool,
    }

    impl ProgramLoader for FixedLoader {
        fn metadata(&self) -> Result<ProgramMetadata> {
            if self.fail_metadata {
                return Err(Error::Error("missing metadata".into()));
            }
            Ok(ProgramMetadata::new().with_main_thread_priority(44))
        }

        fn load(&mut self, _kernel: &KernelCore, process: &Arc<Process>) -> Result<LoadParameters> {
            let mut code_set = CodeSet::new(Arc::new(vec![0u8; 0x1000]));
            code_set.code_mut().size = 0x1000;

            // Map at the base of the code region.
            process.load_module(code_set, 0x0800_0000)?;

            Ok(LoadParameters {
                main_thread_priority: 44,
                main_thread_stack_size: 0x10000,
            })
        }
    }

    #[test]
    fn test_load_starts_the_process() {
        let system = System::new(SystemConfig::default());
        let mut loader = FixedLoader {
            fail_metadata: false,
        };

        let process = system.load("app", &mut loader).unwrap();

        assert_eq!(process.status(), ProcessStatus::Running);
        assert_eq!(process.thread_list().len(), 1);
        assert!(Arc::ptr_eq(
            &system.kernel().current_process().unwrap(),
            &process
        ));
    }

    #[test]
    fn test_load_failure_shuts_the_session_down() {
        let system = System::new(SystemConfig::default());
        let mut loader = FixedLoader {
            fail_metadata: true,
        };

        assert!(system.load("app", &mut loader).is_err());
        assert!(system.kernel().process_list().is_empty());
        assert!(system.kernel().current_process().is_none());
    }
}
