//! Sources: block consumers that feed the mix.
//!
//! A source pulls every attached generator, mixes them to its own channel
//! count, applies its crossfaded gain, and hands the result to its output:
//! the context's direct buffer for direct sources, a panner lane for panned
//! and 3D sources. Every source also routes its block through the router so
//! global effects receive it.
//!
//! The closed set of source kinds is a tagged enum rather than an
//! inheritance tower; shared behavior lives in `fill_block`.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use crate::block_buffer::acquire_block_buffer;
use crate::channel_mixing::mix_channels;
use crate::config::BLOCK_SIZE;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::fade::FadeDriver;
use crate::generator::Generator;
use crate::handle::{Exposable, HandleSlot};
use crate::math::{attenuation_for_distance, DistanceModel, DistanceParams, ListenerPose};
use crate::panner::{LaneToken, PannerBank, PannerStrategy};
use crate::pausable::Pausable;
use crate::properties::{PropertyDescriptor, PropertyHost, PropertyId, PropertyValue};
use crate::router::{OutputId, Router};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKindTag {
    Direct,
    Panned,
    ThreeD,
}

struct PannedState {
    strategy: PannerStrategy,
    lane: Option<Arc<LaneToken>>,
    azimuth: f64,
    elevation: f64,
    panning_scalar: f64,
    /// Whichever of scalar/angles was set last wins.
    is_scalar: bool,
    needs_update: bool,
    valid_lane: bool,
    /// Extra gain applied on the lane write; distance attenuation for 3D.
    gain_3d: f64,
}

impl PannedState {
    fn new() -> Self {
        Self {
            strategy: PannerStrategy::default(),
            lane: None,
            azimuth: 0.0,
            elevation: 0.0,
            panning_scalar: 0.0,
            is_scalar: false,
            needs_update: true,
            valid_lane: false,
            gain_3d: 1.0,
        }
    }
}

struct ThreeDState {
    panned: PannedState,
    position: [f64; 3],
    orientation: [f64; 6],
    distance: DistanceParams,
}

enum SourceKind {
    Direct,
    Panned(PannedState),
    ThreeD(ThreeDState),
}

struct SourceState {
    kind: SourceKind,
    generators: Vec<Weak<dyn Generator>>,
    gain: f64,
    gain_changed: bool,
    gain_fader: FadeDriver,
    pausable: Pausable,
    block: Vec<f32>,
}

pub struct Source {
    context: Arc<Context>,
    handle: HandleSlot,
    output_id: OutputId,
    kind_tag: SourceKindTag,
    state: Mutex<SourceState>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("handle", &self.handle)
            .field("output_id", &self.output_id)
            .field("kind_tag", &self.kind_tag)
            .finish()
    }
}

const DIRECT_SOURCE_PROPERTIES: &[PropertyDescriptor] =
    &[PropertyDescriptor::double(PropertyId::Gain, 0.0, f64::MAX)];

const PANNED_SOURCE_PROPERTIES: &[PropertyDescriptor] = &[
    PropertyDescriptor::double(PropertyId::Gain, 0.0, f64::MAX),
    PropertyDescriptor::double(PropertyId::Azimuth, 0.0, 360.0),
    PropertyDescriptor::double(PropertyId::Elevation, -90.0, 90.0),
    PropertyDescriptor::double(PropertyId::PanningScalar, -1.0, 1.0),
    PropertyDescriptor::int(PropertyId::PannerStrategy, 0, 1),
];

const SOURCE_3D_PROPERTIES: &[PropertyDescriptor] = &[
    PropertyDescriptor::double(PropertyId::Gain, 0.0, f64::MAX),
    PropertyDescriptor::double(PropertyId::Azimuth, 0.0, 360.0),
    PropertyDescriptor::double(PropertyId::Elevation, -90.0, 90.0),
    PropertyDescriptor::double(PropertyId::PanningScalar, -1.0, 1.0),
    PropertyDescriptor::int(PropertyId::PannerStrategy, 0, 1),
    PropertyDescriptor::double3(PropertyId::Position),
    PropertyDescriptor::double6(PropertyId::Orientation),
    PropertyDescriptor::int(PropertyId::DistanceModel, 0, 3),
    PropertyDescriptor::double(PropertyId::DistanceRef, 0.0, f64::MAX),
    PropertyDescriptor::double(PropertyId::DistanceMax, 0.0, f64::MAX),
    PropertyDescriptor::double(PropertyId::Rolloff, 0.0, f64::MAX),
    PropertyDescriptor::double(PropertyId::ClosenessBoost, f64::MIN, f64::MAX),
    PropertyDescriptor::double(PropertyId::ClosenessBoostDistance, 0.0, f64::MAX),
];

impl Source {
    fn create(context: &Arc<Context>, kind: SourceKind) -> Result<Arc<Self>> {
        let kind_tag = match kind {
            SourceKind::Direct => SourceKindTag::Direct,
            SourceKind::Panned(_) => SourceKindTag::Panned,
            SourceKind::ThreeD(_) => SourceKindTag::ThreeD,
        };
        let source = Arc::new(Self {
            context: context.clone(),
            handle: HandleSlot::new(),
            output_id: context.allocate_output_id(),
            kind_tag,
            state: Mutex::new(SourceState {
                kind,
                generators: Vec::new(),
                gain: 1.0,
                gain_changed: false,
                gain_fader: FadeDriver::new(1.0),
                pausable: Pausable::new(),
                block: vec![0.0; BLOCK_SIZE * crate::config::MAX_CHANNELS],
            }),
        });
        context.register_source(&source)?;
        Ok(source)
    }

    /// A source that mixes straight into the output, bypassing panning.
    pub fn new_direct(context: &Arc<Context>) -> Result<Arc<Self>> {
        Self::create(context, SourceKind::Direct)
    }

    /// A mono source panned by azimuth/elevation or a panning scalar.
    pub fn new_panned(context: &Arc<Context>) -> Result<Arc<Self>> {
        Self::create(context, SourceKind::Panned(PannedState::new()))
    }

    /// A mono source spatialized from a world position relative to the
    /// context's listener, with distance attenuation.
    pub fn new_3d(context: &Arc<Context>) -> Result<Arc<Self>> {
        Self::create(
            context,
            SourceKind::ThreeD(ThreeDState {
                panned: PannedState::new(),
                position: [0.0, 0.0, 0.0],
                orientation: [0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
                distance: DistanceParams::default(),
            }),
        )
    }

    pub fn add_generator(self: &Arc<Self>, generator: &Arc<dyn Generator>) -> Result<()> {
        let source = self.clone();
        let generator = generator.clone();
        self.context.post_internal(move |_| {
            let mut state = source.state.lock().unwrap();
            let already = state
                .generators
                .iter()
                .any(|w| w.upgrade().is_some_and(|g| Arc::ptr_eq(&g, &generator)));
            if !already {
                state.generators.push(Arc::downgrade(&generator));
            }
        })
    }

    pub fn remove_generator(self: &Arc<Self>, generator: &Arc<dyn Generator>) -> Result<()> {
        let source = self.clone();
        let generator = generator.clone();
        self.context.post_internal(move |_| {
            let mut state = source.state.lock().unwrap();
            state
                .generators
                .retain(|w| !w.upgrade().is_some_and(|g| Arc::ptr_eq(&g, &generator)));
        })
    }

    /// Fades out over one block, then the source is skipped entirely.
    pub fn pause(self: &Arc<Self>) -> Result<()> {
        let source = self.clone();
        self.context
            .post_internal(move |_| source.state.lock().unwrap().pausable.pause())
    }

    pub fn play(self: &Arc<Self>) -> Result<()> {
        let source = self.clone();
        self.context
            .post_internal(move |_| source.state.lock().unwrap().pausable.play())
    }

    pub(crate) fn output_id(&self) -> OutputId {
        self.output_id
    }

    /// Second-phase initialization on the audio thread: claim a panner lane.
    pub(crate) fn init_in_audio_thread(&self, panners: &mut PannerBank) {
        let mut state = self.state.lock().unwrap();
        if let Some(panned) = panned_mut(&mut state.kind) {
            ensure_lane(panned, panners);
        }
    }

    /// Renders one block. Called only by the context.
    pub(crate) fn run(
        &self,
        channels: usize,
        block_time: u64,
        listener: &ListenerPose,
        router: &mut Router,
        panners: &mut PannerBank,
        direct_buffer: &mut [f32],
    ) {
        let mut state = self.state.lock().unwrap();

        // 3D pose math first: it feeds the lane parameters and lane gain.
        if let SourceKind::ThreeD(three_d) = &mut state.kind {
            let (azimuth, elevation, distance) = listener.spherical_to(three_d.position);
            three_d.panned.azimuth = azimuth;
            three_d.panned.elevation = elevation;
            three_d.panned.is_scalar = false;
            three_d.panned.needs_update = true;
            three_d.panned.gain_3d = attenuation_for_distance(&three_d.distance, distance);
        }

        let source_channels = match self.kind_tag {
            SourceKindTag::Direct => channels,
            SourceKindTag::Panned | SourceKindTag::ThreeD => 1,
        };

        if let Some(panned) = panned_mut(&mut state.kind) {
            if !panned.valid_lane {
                ensure_lane(panned, panners);
            }
            if panned.needs_update {
                if let Some(lane) = &panned.lane {
                    if panned.is_scalar {
                        panners.set_lane_pan(lane, panned.panning_scalar as f32);
                    } else {
                        panners.set_lane_angles(lane, panned.azimuth, panned.elevation);
                    }
                }
                panned.needs_update = false;
            }
        }

        let audible = self.fill_block(&mut state, source_channels, block_time);
        if !audible {
            return;
        }

        match &state.kind {
            SourceKind::Direct => {
                for i in 0..BLOCK_SIZE * channels {
                    direct_buffer[i] += state.block[i];
                }
            }
            SourceKind::Panned(panned) | SourceKind::ThreeD(ThreeDState { panned, .. }) => {
                if let Some(lane) = &panned.lane {
                    panners.write_lane(lane, &state.block[..BLOCK_SIZE], panned.gain_3d as f32);
                }
            }
        }

        router.route_audio(
            self.output_id,
            &state.block[..source_channels * BLOCK_SIZE],
            source_channels,
        );
    }

    /// Mixes all generators into the internal block and applies the gain
    /// fader. Returns false when the source is paused (the block stays
    /// zero and nothing is routed).
    fn fill_block(&self, state: &mut SourceState, channels: usize, block_time: u64) -> bool {
        let mut premix_guard = acquire_block_buffer();
        let premix = premix_guard.as_mut_slice();

        if state.gain_changed || state.pausable.needs_gain_update() {
            let target = state.gain * state.pausable.gain_factor();
            state.gain_fader.set_value(block_time, target);
            state.gain_changed = false;
        }

        state.block[..channels * BLOCK_SIZE].fill(0.0);

        if state.pausable.is_paused() {
            state.pausable.tick();
            return false;
        }
        state.pausable.tick();

        let SourceState {
            generators, block, ..
        } = state;
        generators.retain(|weak| {
            let Some(generator) = weak.upgrade() else {
                return false;
            };
            let generator_channels = generator.channels();
            if generator_channels == 0 {
                return true;
            }
            if generator_channels == channels {
                generator.run(block_time, block);
            } else {
                premix[..generator_channels * BLOCK_SIZE].fill(0.0);
                generator.run(block_time, premix);
                mix_channels(BLOCK_SIZE, premix, generator_channels, block, channels);
            }
            true
        });

        state.gain_fader.drive(block_time, |gain| {
            for i in 0..BLOCK_SIZE {
                let g = gain(i);
                for ch in 0..channels {
                    state.block[i * channels + ch] *= g;
                }
            }
        });
        true
    }
}

fn panned_mut(kind: &mut SourceKind) -> Option<&mut PannedState> {
    match kind {
        SourceKind::Direct => None,
        SourceKind::Panned(p) => Some(p),
        SourceKind::ThreeD(t) => Some(&mut t.panned),
    }
}

/// Claims a lane for the configured strategy, degrading to the stereo
/// panner when the fancier one is out of lanes.
fn ensure_lane(panned: &mut PannedState, panners: &mut PannerBank) {
    panned.lane = None;
    panned.lane = match panners.allocate_lane(panned.strategy) {
        Ok(lane) => Some(lane),
        Err(_) if panned.strategy != PannerStrategy::Stereo => {
            log::warn!(
                "No free {:?} panner lanes; degrading to stereo",
                panned.strategy
            );
            panners.allocate_lane(PannerStrategy::Stereo).ok()
        }
        Err(e) => {
            log::warn!("Panner lane allocation failed: {e}");
            None
        }
    };
    panned.needs_update = true;
    panned.valid_lane = true;
}

impl PropertyHost for Source {
    fn property_descriptors(&self) -> &'static [PropertyDescriptor] {
        match self.kind_tag {
            SourceKindTag::Direct => DIRECT_SOURCE_PROPERTIES,
            SourceKindTag::Panned => PANNED_SOURCE_PROPERTIES,
            SourceKindTag::ThreeD => SOURCE_3D_PROPERTIES,
        }
    }

    fn get_property(&self, id: PropertyId) -> Result<PropertyValue> {
        let mut state = self.state.lock().unwrap();
        if id == PropertyId::Gain {
            return Ok(PropertyValue::Double(state.gain));
        }

        if let SourceKind::ThreeD(three_d) = &state.kind {
            match id {
                PropertyId::Position => return Ok(PropertyValue::Double3(three_d.position)),
                PropertyId::Orientation => {
                    return Ok(PropertyValue::Double6(three_d.orientation))
                }
                PropertyId::DistanceModel => {
                    return Ok(PropertyValue::Int(three_d.distance.model.to_index()))
                }
                PropertyId::DistanceRef => {
                    return Ok(PropertyValue::Double(three_d.distance.distance_ref))
                }
                PropertyId::DistanceMax => {
                    return Ok(PropertyValue::Double(three_d.distance.distance_max))
                }
                PropertyId::Rolloff => {
                    return Ok(PropertyValue::Double(three_d.distance.rolloff))
                }
                PropertyId::ClosenessBoost => {
                    return Ok(PropertyValue::Double(three_d.distance.closeness_boost))
                }
                PropertyId::ClosenessBoostDistance => {
                    return Ok(PropertyValue::Double(
                        three_d.distance.closeness_boost_distance,
                    ))
                }
                _ => {}
            }
        }

        if let Some(panned) = panned_mut(&mut state.kind) {
            match id {
                PropertyId::Azimuth => return Ok(PropertyValue::Double(panned.azimuth)),
                PropertyId::Elevation => return Ok(PropertyValue::Double(panned.elevation)),
                PropertyId::PanningScalar => {
                    return Ok(PropertyValue::Double(panned.panning_scalar))
                }
                PropertyId::PannerStrategy => {
                    return Ok(PropertyValue::Int(panned.strategy.to_index()))
                }
                _ => {}
            }
        }

        Err(Error::PropertyDoesNotExist(format!("{id:?}")))
    }

    fn set_property(&self, id: PropertyId, value: PropertyValue) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let (PropertyId::Gain, PropertyValue::Double(v)) = (id, &value) {
            state.gain = *v;
            state.gain_changed = true;
            return Ok(());
        }

        if let SourceKind::ThreeD(three_d) = &mut state.kind {
            match (id, &value) {
                (PropertyId::Position, PropertyValue::Double3(v)) => {
                    three_d.position = *v;
                    return Ok(());
                }
                (PropertyId::Orientation, PropertyValue::Double6(v)) => {
                    three_d.orientation = *v;
                    return Ok(());
                }
                (PropertyId::DistanceModel, PropertyValue::Int(v)) => {
                    three_d.distance.model = DistanceModel::from_index(*v).ok_or_else(|| {
                        Error::InvalidArgument(format!("bad distance model {v}"))
                    })?;
                    return Ok(());
                }
                (PropertyId::DistanceRef, PropertyValue::Double(v)) => {
                    three_d.distance.distance_ref = *v;
                    return Ok(());
                }
                (PropertyId::DistanceMax, PropertyValue::Double(v)) => {
                    three_d.distance.distance_max = *v;
                    return Ok(());
                }
                (PropertyId::Rolloff, PropertyValue::Double(v)) => {
                    three_d.distance.rolloff = *v;
                    return Ok(());
                }
                (PropertyId::ClosenessBoost, PropertyValue::Double(v)) => {
                    three_d.distance.closeness_boost = *v;
                    return Ok(());
                }
                (PropertyId::ClosenessBoostDistance, PropertyValue::Double(v)) => {
                    three_d.distance.closeness_boost_distance = *v;
                    return Ok(());
                }
                _ => {}
            }
        }

        if let Some(panned) = panned_mut(&mut state.kind) {
            match (id, &value) {
                (PropertyId::Azimuth, PropertyValue::Double(v)) => {
                    panned.azimuth = *v;
                    panned.is_scalar = false;
                    panned.needs_update = true;
                    return Ok(());
                }
                (PropertyId::Elevation, PropertyValue::Double(v)) => {
                    panned.elevation = *v;
                    panned.is_scalar = false;
                    panned.needs_update = true;
                    return Ok(());
                }
                (PropertyId::PanningScalar, PropertyValue::Double(v)) => {
                    panned.panning_scalar = *v;
                    panned.is_scalar = true;
                    panned.needs_update = true;
                    return Ok(());
                }
                (PropertyId::PannerStrategy, PropertyValue::Int(v)) => {
                    panned.strategy = PannerStrategy::from_index(*v).ok_or_else(|| {
                        Error::InvalidArgument(format!("bad panner strategy {v}"))
                    })?;
                    // The lane is reallocated on the next block.
                    panned.valid_lane = false;
                    return Ok(());
                }
                _ => {}
            }
        }

        Err(Error::PropertyDoesNotExist(format!("{id:?}")))
    }
}

impl Exposable for Source {
    fn handle_slot(&self) -> &HandleSlot {
        &self.handle
    }

    fn context_ref(&self) -> Option<Arc<Context>> {
        Some(self.context.clone())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn kind_name(&self) -> &'static str {
        match self.kind_tag {
            SourceKindTag::Direct => "direct_source",
            SourceKindTag::Panned => "panned_source",
            SourceKindTag::ThreeD => "source_3d",
        }
    }

    fn output_endpoint(&self) -> Option<OutputId> {
        Some(self.output_id)
    }
}
