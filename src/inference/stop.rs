use crate::conversation::IM_END;

use super::runtime::ModelRuntime;

/// Marker Qwen-family models emit at the end of an assistant turn.
pub const END_OF_TURN_TOKEN: &str = IM_END;

/// Token ids that halt the decode loop. Computed once per generator; checked
/// against the last sampled id only, so the set stays tiny (usually eos plus
/// the end-of-turn marker).
#[derive(Debug, Clone, Default)]
pub struct StopTokens {
    ids: Vec<u32>,
}

impl StopTokens {
    pub fn for_runtime(runtime: &dyn ModelRuntime) -> Self {
        let mut ids = Vec::with_capacity(2);

        if let Some(eos) = runtime.eos_token_id() {
            ids.push(eos);
        }

        // Explicit optional lookup: a vocabulary without the marker simply
        // yields None, and an unk-mapped id does not count as present.
        if let Some(end_of_turn) = runtime.token_to_id(END_OF_TURN_TOKEN) {
            let is_unknown = runtime.unk_token_id() == Some(end_of_turn);
            if !is_unknown && !ids.contains(&end_of_turn) {
                ids.push(end_of_turn);
            }
        }

        Self { ids }
    }

    #[inline]
    pub fn is_stop(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::runtime::testing::ScriptedRuntime;

    #[test]
    fn includes_eos_and_end_of_turn() {
        let mut runtime = ScriptedRuntime::with_fragments(&[]);
        runtime.eos = Some(151643);
        runtime.vocab = vec![(END_OF_TURN_TOKEN.to_string(), 151645)];

        let stop = StopTokens::for_runtime(&runtime);
        assert_eq!(stop.ids(), &[151643, 151645]);
        assert!(stop.is_stop(151643));
        assert!(stop.is_stop(151645));
        assert!(!stop.is_stop(42));
    }

    #[test]
    fn skips_end_of_turn_when_absent_from_vocab() {
        let mut runtime = ScriptedRuntime::with_fragments(&[]);
        runtime.eos = Some(7);

        let stop = StopTokens::for_runtime(&runtime);
        assert_eq!(stop.ids(), &[7]);
    }

    #[test]
    fn skips_end_of_turn_when_it_maps_to_unk() {
        let mut runtime = ScriptedRuntime::with_fragments(&[]);
        runtime.eos = Some(7);
        runtime.unk = Some(0);
        runtime.vocab = vec![(END_OF_TURN_TOKEN.to_string(), 0)];

        let stop = StopTokens::for_runtime(&runtime);
        assert_eq!(stop.ids(), &[7]);
    }

    #[test]
    fn deduplicates_eos_and_end_of_turn() {
        let mut runtime = ScriptedRuntime::with_fragments(&[]);
        runtime.eos = Some(151645);
        runtime.vocab = vec![(END_OF_TURN_TOKEN.to_string(), 151645)];

        let stop = StopTokens::for_runtime(&runtime);
        assert_eq!(stop.ids(), &[151645]);
    }

    #[test]
    fn empty_when_runtime_reports_nothing() {
        let mut runtime = ScriptedRuntime::with_fragments(&[]);
        runtime.eos = None;

        let stop = StopTokens::for_runtime(&runtime);
        assert!(stop.ids().is_empty());
    }
}
