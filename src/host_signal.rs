/*
 * This file is part of module-reconciler, licensed under the MIT License (MIT).
 *
 * Copyright (c) 2024 easybill GmbH
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Sends the process-level signal the host interprets as "reload configuration
/// and module set". Implementations must not assume a non-PID-1 process layout;
/// this is a container-specific contract, not a general IPC mechanism.
pub(crate) trait HostSignal: Send + Sync {
    fn send(&self) -> anyhow::Result<()>;
}

/// Sends `SIGUSR2` to PID 1 of the containing process group, as the host
/// supervisor expects.
pub(crate) struct Sigusr2Signal;

impl HostSignal for Sigusr2Signal {
    fn send(&self) -> anyhow::Result<()> {
        signal::kill(Pid::from_raw(1), Signal::SIGUSR2)?;
        Ok(())
    }
}
