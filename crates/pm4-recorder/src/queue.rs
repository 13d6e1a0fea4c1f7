//! Queues: a kernel context per engine plus the streams every submission starts with.

use std::sync::Arc;

use pm4_protocol::packet::{CONTEXT_CONTROL_LOAD_ENABLE, CONTEXT_CONTROL_SHADOW_ENABLE};
use pm4_protocol::regs::COMPUTE_START_X;
use pm4_protocol::{DwordSink, Opcode, Pm4Emit};
use pm4_winsys::{
    CmdStream, ContextPriority, HwIp, SubmitContext, SubmitRequest, SyncPoint, WinsysError,
};
use tracing::{debug, error};

use crate::cmd_buffer::{CommandBuffer, CommandBufferLevel, CommandBufferStatus};
use crate::device::Device;
use crate::error::{Error, Result};

/// One batch of command buffers with the syncobjs it waits on and signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [&'a CommandBuffer],
    pub waits: &'a [SyncPoint],
    pub signals: &'a [SyncPoint],
}

pub struct Queue {
    device: Arc<Device>,
    ip: HwIp,
    ring: u32,
    ctx: Arc<SubmitContext>,
    /// Initial register state, sent as the first IB of every submission.
    preamble: Option<CmdStream>,
    /// Submitted for batches without command buffers so their syncobjs still signal.
    noop: CmdStream,
}

impl Queue {
    pub fn new(device: Arc<Device>, ip: HwIp, priority: ContextPriority) -> Result<Self> {
        let winsys = device.winsys();
        let ctx = winsys.create_context(priority)?;

        let preamble = match ip {
            HwIp::Gfx => {
                let mut cs = winsys.create_cs(ip)?;
                cs.reserve(5);
                cs.emit_pkt3(
                    Opcode::ContextControl,
                    &[CONTEXT_CONTROL_LOAD_ENABLE | 1, CONTEXT_CONTROL_SHADOW_ENABLE | 1],
                );
                cs.emit_pkt3(Opcode::ClearState, &[0]);
                cs.finalize()?;
                Some(cs)
            }
            HwIp::Compute => {
                let mut cs = winsys.create_cs(ip)?;
                cs.reserve(5);
                cs.set_sh_reg_seq(COMPUTE_START_X, 3);
                cs.emit_slice(&[0; 3]);
                cs.finalize()?;
                Some(cs)
            }
            HwIp::Dma => None,
        };

        let mut noop = winsys.create_cs(ip)?;
        noop.reserve(2);
        noop.emit_pkt3(Opcode::Nop, &[0]);
        noop.finalize()?;

        debug!(?ip, ?priority, context = ctx.id(), "created queue");
        Ok(Self {
            device,
            ip,
            ring: 0,
            ctx,
            preamble,
            noop,
        })
    }

    pub fn ip(&self) -> HwIp {
        self.ip
    }

    pub fn context(&self) -> &Arc<SubmitContext> {
        &self.ctx
    }

    /// Submits each batch in order and returns the sequence number of the last one.
    pub fn submit(&self, submits: &[SubmitInfo<'_>]) -> Result<u64> {
        for info in submits {
            for cb in info.command_buffers {
                if cb.level() != CommandBufferLevel::Primary {
                    return Err(Error::SecondarySubmitted);
                }
                if cb.status() != CommandBufferStatus::Executable {
                    return Err(Error::NotExecutable { status: cb.status() });
                }
                assert_eq!(cb.ip(), self.ip, "command buffer recorded for another engine");
            }
        }

        let mut seq = self.ctx.last_submission(self.ip, self.ring).unwrap_or(0);
        for info in submits {
            let streams: Vec<&CmdStream> = if info.command_buffers.is_empty() {
                vec![&self.noop]
            } else {
                info.command_buffers.iter().map(|cb| cb.cs()).collect()
            };
            let request = SubmitRequest {
                ip: self.ip,
                ring: self.ring,
                preamble: self.preamble.as_ref(),
                streams: &streams,
                waits: info.waits,
                signals: info.signals,
            };
            seq = self
                .device
                .winsys()
                .submit(&self.ctx, &request)
                .map_err(|err| self.report(err))?;
            self.device.stats().inc_submissions();
        }
        Ok(seq)
    }

    fn report(&self, err: WinsysError) -> Error {
        match &err {
            WinsysError::DeviceLost => {
                error!(ip = ?self.ip, context = self.ctx.id(), "device lost");
            }
            WinsysError::SubmissionRejected { detail } => {
                error!(ip = ?self.ip, %detail, "submission rejected");
            }
            _ => {}
        }
        err.into()
    }

    /// Waits for everything submitted so far. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout_ns: u64) -> Result<bool> {
        Ok(self.ctx.wait_idle(self.ip, self.ring, timeout_ns)?)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("ip", &self.ip)
            .field("ring", &self.ring)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::test_util::test_device_with_sim;
    use pm4_winsys::KernelError;
    use pretty_assertions::assert_eq;

    #[test]
    fn submissions_carry_the_preamble() {
        let (device, _allocator, kernel) = test_device_with_sim(DeviceConfig::default());
        let queue = Queue::new(device.clone(), HwIp::Gfx, ContextPriority::Medium).unwrap();
        let mut cb = CommandBuffer::new(device.clone(), HwIp::Gfx, CommandBufferLevel::Primary)
            .unwrap();
        cb.begin();
        cb.begin_pipeline_statistics();
        cb.end().unwrap();

        let seq = queue
            .submit(&[SubmitInfo {
                command_buffers: &[&cb],
                ..SubmitInfo::default()
            }])
            .unwrap();
        let submission = kernel.last_submission().unwrap();
        assert_eq!(submission.seq, seq);
        assert_eq!(submission.ib_count(), 2);
        assert_eq!(device.stats().snapshot().submissions, 1);
        assert!(queue.wait_idle(1_000_000).unwrap());
    }

    #[test]
    fn empty_batches_submit_a_noop() {
        let (device, _allocator, kernel) = test_device_with_sim(DeviceConfig::default());
        let queue = Queue::new(device, HwIp::Dma, ContextPriority::Medium).unwrap();
        queue.submit(&[SubmitInfo::default()]).unwrap();
        assert_eq!(kernel.last_submission().unwrap().ib_count(), 1);
    }

    #[test]
    fn invalid_command_buffers_are_refused() {
        let (device, _allocator, kernel) = test_device_with_sim(DeviceConfig::default());
        let queue = Queue::new(device.clone(), HwIp::Gfx, ContextPriority::Medium).unwrap();

        let recording =
            CommandBuffer::new(device.clone(), HwIp::Gfx, CommandBufferLevel::Primary).unwrap();
        assert_eq!(
            queue.submit(&[SubmitInfo {
                command_buffers: &[&recording],
                ..SubmitInfo::default()
            }]),
            Err(Error::NotExecutable {
                status: CommandBufferStatus::Initial
            })
        );

        let mut secondary =
            CommandBuffer::new(device, HwIp::Gfx, CommandBufferLevel::Secondary).unwrap();
        secondary.begin();
        secondary.end().unwrap();
        assert_eq!(
            queue.submit(&[SubmitInfo {
                command_buffers: &[&secondary],
                ..SubmitInfo::default()
            }]),
            Err(Error::SecondarySubmitted)
        );
        assert!(kernel.submissions().is_empty());
    }

    #[test]
    fn kernel_failures_are_classified() {
        let (device, _allocator, kernel) = test_device_with_sim(DeviceConfig::default());
        let queue = Queue::new(device, HwIp::Compute, ContextPriority::High).unwrap();

        kernel.fail_next_submit(KernelError::Rejected { errno: 22 });
        assert!(matches!(
            queue.submit(&[SubmitInfo::default()]),
            Err(Error::SubmissionRejected { .. })
        ));
        assert!(!queue.context().is_lost());

        kernel.fail_next_submit(KernelError::Cancelled);
        assert_eq!(queue.submit(&[SubmitInfo::default()]), Err(Error::DeviceLost));
        assert!(queue.context().is_lost());
        assert_eq!(queue.submit(&[SubmitInfo::default()]), Err(Error::DeviceLost));
    }
}
