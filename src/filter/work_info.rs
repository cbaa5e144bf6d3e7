//! N:M correlation between an admitted [`Work`] and the completions its
//! inputs produce.

use crate::buffer::{Buffer, BufferId};
use crate::types::{OutputKind, Work};

/// Bookkeeping for one admitted work.
///
/// `in_data_num` is fixed at admission. `out_data_num` counts final
/// completions (a `Single` output, a drop or a bypass), so it never exceeds
/// `in_data_num`; `Multi` outputs are appended without counting.
#[derive(Debug)]
pub(crate) struct WorkInfo {
    work: Work,
    in_data_num: usize,
    out_data_num: usize,
    /// Inputs still waiting for their final completion.
    pending: Vec<BufferId>,
}

impl WorkInfo {
    /// Consume every unconsumed buffer of `work` and start tracking it.
    pub(crate) fn admit(mut work: Work) -> Self {
        let pending: Vec<BufferId> = work.unconsumed().iter().map(Buffer::id).collect();
        let in_data_num = pending.len();
        work.input_index += in_data_num;
        Self {
            work,
            in_data_num,
            out_data_num: 0,
            pending,
        }
    }

    #[inline]
    pub(crate) fn claims(&self, input: BufferId) -> bool {
        self.pending.contains(&input)
    }

    pub(crate) fn pending_inputs(&self) -> &[BufferId] {
        &self.pending
    }

    pub(crate) fn in_data_num(&self) -> usize {
        self.in_data_num
    }

    pub(crate) fn out_data_num(&self) -> usize {
        self.out_data_num
    }

    pub(crate) fn frame_index(&self) -> u64 {
        self.work.frame_index
    }

    /// Record an output for `input`. Returns true once the work may retire.
    pub(crate) fn complete(
        &mut self,
        input: BufferId,
        output: Option<Buffer>,
        kind: OutputKind,
    ) -> bool {
        if let Some(out) = output {
            self.work.buffers.push(out);
        }
        match kind {
            OutputKind::Multi => false,
            OutputKind::Single => self.finish_input(input),
        }
    }

    /// Pass `input` through untouched: it moves from the consumed region to
    /// the tail so the next stage sees it as unconsumed.
    pub(crate) fn bypass(&mut self, input: BufferId) -> bool {
        let consumed = self.work.input_index.min(self.work.buffers.len());
        if let Some(pos) = self.work.buffers[..consumed]
            .iter()
            .position(|b| b.id() == input)
        {
            let buf = self.work.buffers.remove(pos);
            self.work.input_index -= 1;
            self.work.buffers.push(buf);
        }
        self.finish_input(input)
    }

    fn finish_input(&mut self, input: BufferId) -> bool {
        if let Some(pos) = self.pending.iter().position(|id| *id == input) {
            self.pending.remove(pos);
            self.out_data_num += 1;
        }
        self.out_data_num >= self.in_data_num
    }

    pub(crate) fn into_work(self) -> Work {
        self.work
    }

    /// Undo admission for a work that was never processed.
    pub(crate) fn rewind(mut self) -> Work {
        self.work.input_index = self.work.input_index.saturating_sub(self.in_data_num);
        self.work
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_admit_advances_cursor() {
        let head = Buffer::linear(8);
        let a = Buffer::linear(8);
        let b = Buffer::linear(8);
        let mut work = Work::new(3, vec![head, a.clone(), b.clone()]);
        work.input_index = 1;

        let info = WorkInfo::admit(work);
        assert_eq!(info.in_data_num(), 2);
        assert_eq!(info.pending_inputs(), &[a.id(), b.id()]);
        assert_eq!(info.into_work().input_index, 3);
    }

    #[test]
    fn test_bypass_moves_input_to_unconsumed_tail() {
        let buf = Buffer::linear(8);
        let mut info = WorkInfo::admit(Work::new(0, vec![buf.clone()]));
        assert!(info.bypass(buf.id()));

        let work = info.into_work();
        assert_eq!(work.input_index, 0);
        assert_eq!(work.buffers, vec![buf]);
    }

    #[test]
    fn test_multi_outputs_wait_for_single() {
        let input = Buffer::linear(8);
        let out1 = Buffer::linear(8);
        let out2 = Buffer::linear(8);
        let mut info = WorkInfo::admit(Work::new(0, vec![input.clone()]));

        assert!(!info.complete(input.id(), Some(out1.clone()), OutputKind::Multi));
        assert_eq!(info.out_data_num(), 0);
        assert!(info.complete(input.id(), Some(out2.clone()), OutputKind::Single));

        let work = info.into_work();
        assert_eq!(work.unconsumed(), &[out1, out2]);
    }

    #[test]
    fn test_drop_counts_without_appending() {
        let a = Buffer::linear(8);
        let b = Buffer::linear(8);
        let mut info = WorkInfo::admit(Work::new(0, vec![a.clone(), b.clone()]));
        assert!(!info.complete(a.id(), None, OutputKind::Single));
        assert!(!info.claims(a.id()));
        assert!(info.claims(b.id()));
        assert!(info.complete(b.id(), None, OutputKind::Single));
        assert_eq!(info.into_work().unconsumed_count(), 0);
    }

    #[test]
    fn test_unknown_input_does_not_count() {
        let a = Buffer::linear(8);
        let stranger = Buffer::linear(8);
        let mut info = WorkInfo::admit(Work::new(0, vec![a]));
        assert!(!info.complete(stranger.id(), None, OutputKind::Single));
        assert_eq!(info.out_data_num(), 0);
    }

    proptest! {
        #[test]
        fn test_out_never_exceeds_in(n in 1usize..8, extra in 0usize..8) {
            let inputs: Vec<Buffer> = (0..n).map(|_| Buffer::linear(4)).collect();
            let mut info = WorkInfo::admit(Work::new(0, inputs.clone()));
            let mut retired = 0;
            for (i, buf) in inputs.iter().chain(inputs.iter().take(extra)).enumerate() {
                let done = if i % 2 == 0 {
                    info.complete(buf.id(), Some(Buffer::linear(4)), OutputKind::Single)
                } else {
                    info.bypass(buf.id())
                };
                prop_assert!(info.out_data_num() <= info.in_data_num());
                if done {
                    retired += 1;
                }
            }
            prop_assert!(retired >= 1);
            prop_assert_eq!(info.out_data_num(), n);
        }
    }
}
