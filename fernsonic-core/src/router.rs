//! The effect-send router.
//!
//! A router is a sorted set of weighted edges from output endpoints
//! (sources) to input endpoints (global effects). Each edge carries a
//! [`LinearFader`] so that establishing, retargeting, and removing routes is
//! click-free. The router also owns the accumulation buffer for every input
//! endpoint; effects read their buffer after all sources have routed.
//!
//! The router lives entirely on the audio thread. External mutation arrives
//! as commands, so when two configure calls race on the same edge the one
//! consumed later simply wins.

use std::collections::HashMap;

use crate::block_buffer::acquire_block_buffer;
use crate::channel_mixing::mix_channels;
use crate::config::BLOCK_SIZE;
use crate::fade::LinearFader;

/// Identity of a routing writer (a source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId(pub(crate) u64);

/// Identity of a routing reader (a global effect).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputId(pub(crate) u64);

struct Route {
    output: OutputId,
    input: InputId,
    fader: LinearFader,
}

struct InputBuffer {
    channels: usize,
    data: Vec<f32>,
}

pub(crate) struct Router {
    time: u64,
    routes: Vec<Route>,
    inputs: HashMap<InputId, InputBuffer>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self {
            time: 0,
            routes: Vec::with_capacity(16),
            inputs: HashMap::new(),
        }
    }

    /// Registers an input endpoint. `storage` must hold at least
    /// `channels * BLOCK_SIZE` floats; it is allocated by the caller so that
    /// registration itself stays allocation-free.
    pub(crate) fn register_input(&mut self, input: InputId, channels: usize, storage: Vec<f32>) {
        debug_assert!(storage.len() >= channels * BLOCK_SIZE);
        self.inputs.insert(
            input,
            InputBuffer {
                channels,
                data: storage,
            },
        );
    }

    /// Drops an input endpoint and every edge that fed it.
    pub(crate) fn unregister_input(&mut self, input: InputId) {
        self.inputs.remove(&input);
        self.routes.retain(|r| r.input != input);
    }

    /// Drops every edge originating at `output`.
    pub(crate) fn unregister_output(&mut self, output: OutputId) {
        self.routes.retain(|r| r.output != output);
    }

    /// Inserts or retargets the edge (output → input). The fade starts from
    /// the edge's current gain, so hammering on this from the outside still
    /// sounds reasonable; brand-new edges fade up from silence.
    pub(crate) fn configure_route(
        &mut self,
        output: OutputId,
        input: InputId,
        gain: f64,
        fade_blocks: u64,
    ) {
        let time = self.time;
        match self
            .routes
            .binary_search_by(|r| (r.output, r.input).cmp(&(output, input)))
        {
            Ok(index) => {
                let route = &mut self.routes[index];
                let current = route.fader.value(time);
                route.fader = LinearFader::new(time, current, time + fade_blocks, gain);
            }
            Err(index) => {
                self.routes.insert(
                    index,
                    Route {
                        output,
                        input,
                        fader: LinearFader::new(time, 0.0, time + fade_blocks, gain),
                    },
                );
            }
        }
    }

    /// Fades the edge to silence; it is collected at the following block
    /// boundary. Unknown edges are ignored.
    pub(crate) fn remove_route(&mut self, output: OutputId, input: InputId, fade_blocks: u64) {
        if self
            .routes
            .binary_search_by(|r| (r.output, r.input).cmp(&(output, input)))
            .is_ok()
        {
            self.configure_route(output, input, 0.0, fade_blocks);
        }
    }

    /// Fades every edge originating at `output` to silence.
    pub(crate) fn remove_all_routes(&mut self, output: OutputId, fade_blocks: u64) {
        let pairs: Vec<(OutputId, InputId)> = self
            .routes
            .iter()
            .filter(|r| r.output == output)
            .map(|r| (r.output, r.input))
            .collect();
        for (o, i) in pairs {
            self.configure_route(o, i, 0.0, fade_blocks);
        }
    }

    /// Mixes one block emitted by `output` into every routed input buffer,
    /// applying the per-edge fade and channel conversion.
    pub(crate) fn route_audio(&mut self, output: OutputId, block: &[f32], channels: usize) {
        let Router { routes, inputs, time } = self;
        let start = routes.partition_point(|r| r.output < output);
        if start >= routes.len() || routes[start].output != output {
            return;
        }

        let mut working_guard = acquire_block_buffer();
        let working = working_guard.as_mut_slice();

        for route in routes[start..].iter().take_while(|r| r.output == output) {
            let Some(input) = inputs.get_mut(&route.input) else {
                continue;
            };

            let gain_start = route.fader.value(*time) as f32;
            let gain_end = route.fader.value(*time + 1) as f32;
            if gain_start != gain_end {
                for frame in 0..BLOCK_SIZE {
                    let w2 = frame as f32 / BLOCK_SIZE as f32;
                    let gain = (1.0 - w2) * gain_start + w2 * gain_end;
                    for ch in 0..channels {
                        working[frame * channels + ch] = gain * block[frame * channels + ch];
                    }
                }
            } else {
                if gain_end == 0.0 {
                    continue;
                }
                for i in 0..BLOCK_SIZE * channels {
                    working[i] = gain_end * block[i];
                }
            }
            mix_channels(BLOCK_SIZE, working, channels, &mut input.data, input.channels);
        }
    }

    /// The accumulated input block for an endpoint, if it is registered.
    pub(crate) fn input_buffer(&self, input: InputId) -> Option<(&[f32], usize)> {
        self.inputs
            .get(&input)
            .map(|b| (&b.data[..b.channels * BLOCK_SIZE], b.channels))
    }

    /// Zeroes an input accumulator for the next block.
    pub(crate) fn clear_input(&mut self, input: InputId) {
        if let Some(buffer) = self.inputs.get_mut(&input) {
            buffer.data.fill(0.0);
        }
    }

    /// Advances router time and collects edges that have faded out or lost
    /// their input endpoint.
    pub(crate) fn finish_block(&mut self) {
        self.time += 1;
        let time = self.time;
        let inputs = &self.inputs;
        self.routes.retain(|r| {
            inputs.contains_key(&r.input)
                && (r.fader.value(time) != 0.0 || r.fader.is_fading(time))
        });
    }

    #[cfg(test)]
    fn edge_count(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_router_with_input(input: InputId, channels: usize) -> Router {
        let mut router = Router::new();
        router.register_input(input, channels, vec![0.0; channels * BLOCK_SIZE]);
        router
    }

    #[test]
    fn test_route_applies_gain_and_upmix() {
        let output = OutputId(1);
        let input = InputId(2);
        let mut router = test_router_with_input(input, 2);
        router.configure_route(output, input, 0.5, 0);

        let block = vec![1.0f32; BLOCK_SIZE];
        router.route_audio(output, &block, 1);

        let (data, channels) = router.input_buffer(input).unwrap();
        assert_eq!(channels, 2);
        assert!(data.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_configure_remove_configure_equals_single_configure() {
        let output = OutputId(1);
        let input = InputId(2);

        let mut churned = test_router_with_input(input, 1);
        churned.configure_route(output, input, 0.7, 0);
        churned.remove_route(output, input, 0);
        churned.configure_route(output, input, 0.7, 0);

        let mut single = test_router_with_input(input, 1);
        single.configure_route(output, input, 0.7, 0);

        let block = vec![1.0f32; BLOCK_SIZE];
        churned.route_audio(output, &block, 1);
        single.route_audio(output, &block, 1);

        assert_eq!(churned.edge_count(), single.edge_count());
        assert_eq!(
            churned.input_buffer(input).unwrap().0,
            single.input_buffer(input).unwrap().0
        );
    }

    #[test]
    fn test_removed_edge_is_collected() {
        let output = OutputId(1);
        let input = InputId(2);
        let mut router = test_router_with_input(input, 1);
        router.configure_route(output, input, 1.0, 0);
        router.remove_route(output, input, 0);
        router.finish_block();
        assert_eq!(router.edge_count(), 0);
    }

    #[test]
    fn test_fading_edge_interpolates_across_block() {
        let output = OutputId(1);
        let input = InputId(2);
        let mut router = test_router_with_input(input, 1);
        router.configure_route(output, input, 1.0, 1);

        let block = vec![1.0f32; BLOCK_SIZE];
        router.route_audio(output, &block, 1);

        let (data, _) = router.input_buffer(input).unwrap();
        assert_eq!(data[0], 0.0);
        let expected_last = (BLOCK_SIZE - 1) as f32 / BLOCK_SIZE as f32;
        assert!((data[BLOCK_SIZE - 1] - expected_last).abs() < 1e-6);
    }

    #[test]
    fn test_unregistered_input_edges_are_collected() {
        let output = OutputId(1);
        let input = InputId(2);
        let mut router = test_router_with_input(input, 1);
        router.configure_route(output, input, 1.0, 0);
        router.unregister_input(input);
        router.finish_block();
        assert_eq!(router.edge_count(), 0);
    }
}
