//! The context: owner of the audio thread and the whole graph.
//!
//! All rendering happens on a single audio thread: the device output thread
//! in normal operation, or whichever thread calls
//! [`Context::generate_audio`] in headless mode. External threads never
//! touch the graph directly; they validate and enqueue property writes,
//! submit commands, and free handles, all of which the audio thread drains
//! at well-defined points in the per-block sequence.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::audio_output::AudioOutput;
use crate::command::{Command, CommandRing};
use crate::config::{
    BLOCK_SIZE, COMMAND_RING_CAPACITY, DELETION_DRAIN_LIMIT, MAX_CHANNELS, SR,
};
use crate::deletion::{deletion_queue, DeletionReceiver, DeletionSender};
use crate::effects::GlobalEffect;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventQueue};
use crate::fade::FadeDriver;
use crate::handle::{Exposable, HandleSlot};
use crate::math::ListenerPose;
use crate::panner::PannerBank;
use crate::properties::{
    PropertyDescriptor, PropertyHost, PropertyId, PropertyRing, PropertyValue,
};
use crate::router::{InputId, OutputId, Router};
use crate::source::Source;

struct SourceEntry {
    output: OutputId,
    source: Weak<Source>,
}

struct EffectEntry {
    input: InputId,
    effect: Weak<dyn GlobalEffect>,
}

/// Everything owned exclusively by the audio thread. External threads reach
/// it only through commands.
pub struct AudioState {
    pub(crate) router: Router,
    pub(crate) panners: PannerBank,
    sources: HashMap<usize, SourceEntry>,
    effects: Vec<EffectEntry>,
    direct_buffer: Vec<f32>,
    gain_fader: FadeDriver,
    deletion_rx: DeletionReceiver,
    // Reused across blocks so the per-block loop does not allocate.
    live_sources: Vec<Arc<Source>>,
    live_effects: Vec<(InputId, Arc<dyn GlobalEffect>)>,
}

struct ListenerState {
    pose: ListenerPose,
    gain: f64,
    gain_changed: bool,
}

pub struct Context {
    headless: bool,
    channels: usize,
    handle: HandleSlot,
    running: AtomicBool,
    in_audio_callback: AtomicBool,
    block_time: AtomicU64,
    next_endpoint_id: AtomicU64,
    commands: CommandRing,
    property_ring: PropertyRing,
    deletion: DeletionSender,
    events: EventQueue,
    listener: Mutex<ListenerState>,
    audio: Mutex<AudioState>,
    output: Mutex<Option<AudioOutput>>,
}

const CONTEXT_PROPERTIES: &[PropertyDescriptor] = &[
    PropertyDescriptor::double(PropertyId::Gain, 0.0, f64::MAX),
    PropertyDescriptor::double3(PropertyId::Position),
    PropertyDescriptor::double6(PropertyId::Orientation),
];

impl Context {
    fn build(headless: bool, channels: usize) -> Result<Arc<Self>> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(
                Error::InvalidArgument(format!("unsupported channel count {channels}")).record(),
            );
        }
        let (deletion_tx, deletion_rx) = deletion_queue();
        Ok(Arc::new(Self {
            headless,
            channels,
            handle: HandleSlot::new(),
            running: AtomicBool::new(true),
            in_audio_callback: AtomicBool::new(false),
            block_time: AtomicU64::new(0),
            next_endpoint_id: AtomicU64::new(1),
            commands: CommandRing::new(),
            property_ring: PropertyRing::new(),
            deletion: deletion_tx,
            events: EventQueue::new(),
            listener: Mutex::new(ListenerState {
                pose: ListenerPose::default(),
                gain: 1.0,
                gain_changed: false,
            }),
            audio: Mutex::new(AudioState {
                router: Router::new(),
                panners: PannerBank::new(),
                sources: HashMap::new(),
                effects: Vec::new(),
                direct_buffer: vec![0.0; BLOCK_SIZE * MAX_CHANNELS],
                gain_fader: FadeDriver::new(1.0),
                deletion_rx,
                live_sources: Vec::with_capacity(16),
                live_effects: Vec::with_capacity(4),
            }),
            output: Mutex::new(None),
        }))
    }

    /// A context rendering to the default output device. The device stream's
    /// callback thread becomes the audio thread.
    pub fn new_with_device(channels: usize) -> Result<Arc<Self>> {
        let context = Self::build(false, channels)?;
        let output = AudioOutput::start(Arc::downgrade(&context), channels)?;
        *context.output.lock().unwrap() = Some(output);
        Ok(context)
    }

    /// A context with no device: the caller drives rendering by invoking
    /// [`Context::generate_audio`] from a single thread.
    pub fn new_headless(channels: usize) -> Result<Arc<Self>> {
        Self::build(true, channels)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Monotonic count of blocks rendered so far.
    pub fn block_time(&self) -> u64 {
        self.block_time.load(Ordering::Acquire)
    }

    /// The next queued event, if any.
    pub fn poll_event(&self) -> Option<Event> {
        self.events.poll()
    }

    pub(crate) fn emit_event(&self, kind: EventKind, source: crate::handle::Handle) {
        self.events.emit(kind, source);
    }

    pub(crate) fn allocate_output_id(&self) -> OutputId {
        OutputId(self.next_endpoint_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_input_id(&self) -> InputId {
        InputId(self.next_endpoint_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Hands an owning reference to the deferred-deletion queue. The object
    /// is destroyed on the audio thread after the next block boundary.
    pub(crate) fn enqueue_deletion(&self, object: Box<dyn Any + Send>) {
        self.deletion
            .enqueue(self.block_time.load(Ordering::Acquire), object);
    }

    pub(crate) fn post_internal<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AudioState) + Send + 'static,
    {
        self.commands
            .enqueue(Command::new(f))
            .map_err(Error::record)
    }

    /// Runs `f` on the audio thread before the next block, fire-and-forget.
    /// Fails with `ResourceExhausted` when the command ring is full.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_internal(move |_| f())
    }

    /// Runs `f` on the audio thread and waits for its result. Headless
    /// contexts short-circuit and call `f` on the calling thread.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.headless {
            return Ok(f());
        }
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::NotSupported("context is shut down".into()).record());
        }
        let (cmd, rx) = Command::waitable(move |_| f());
        self.commands.enqueue(cmd).map_err(Error::record)?;
        rx.recv()
            .map_err(|_| Error::Internal("context stopped before replying".into()).record())
    }

    /// Registers a source: the audio thread claims its panner lane and adds
    /// it to the iteration set. The context keeps only a weak reference.
    pub(crate) fn register_source(&self, source: &Arc<Source>) -> Result<()> {
        let strong = source.clone();
        self.post_internal(move |audio| {
            strong.init_in_audio_thread(&mut audio.panners);
            audio.sources.insert(
                Arc::as_ptr(&strong) as usize,
                SourceEntry {
                    output: strong.output_id(),
                    source: Arc::downgrade(&strong),
                },
            );
        })
    }

    /// Registers a global effect and its router input endpoint.
    pub(crate) fn register_global_effect(&self, effect: &Arc<impl GlobalEffect + 'static>) -> Result<()> {
        let strong: Arc<dyn GlobalEffect> = effect.clone();
        let channels = strong.input_channels();
        let storage = vec![0.0f32; channels * BLOCK_SIZE];
        self.post_internal(move |audio| {
            let Some(input) = strong.input_endpoint() else {
                log::error!("Global effect has no input endpoint; dropping registration");
                return;
            };
            audio.router.register_input(input, channels, storage);
            audio.effects.push(EffectEntry {
                input,
                effect: Arc::downgrade(&strong),
            });
        })
    }

    /// Validates synchronously, then queues the write for application at the
    /// top of the next block.
    pub fn set_property(
        &self,
        target: Arc<dyn Exposable>,
        id: PropertyId,
        value: PropertyValue,
    ) -> Result<()> {
        target.validate_property(id, &value).map_err(Error::record)?;
        self.property_ring
            .enqueue(&target, id, value)
            .map_err(Error::record)
    }

    /// Reads the last-applied value through a command round-trip.
    pub fn get_property(&self, target: Arc<dyn Exposable>, id: PropertyId) -> Result<PropertyValue> {
        self.call(move || target.get_property(id))?
            .map_err(Error::record)
    }

    pub fn set_double(&self, target: Arc<dyn Exposable>, id: PropertyId, value: f64) -> Result<()> {
        self.set_property(target, id, PropertyValue::Double(value))
    }

    pub fn get_double(&self, target: Arc<dyn Exposable>, id: PropertyId) -> Result<f64> {
        match self.get_property(target, id)? {
            PropertyValue::Double(v) => Ok(v),
            other => Err(Error::PropertyType(format!("{id:?} is {other:?}, not double")).record()),
        }
    }

    pub fn set_int(&self, target: Arc<dyn Exposable>, id: PropertyId, value: i32) -> Result<()> {
        self.set_property(target, id, PropertyValue::Int(value))
    }

    pub fn get_int(&self, target: Arc<dyn Exposable>, id: PropertyId) -> Result<i32> {
        match self.get_property(target, id)? {
            PropertyValue::Int(v) => Ok(v),
            other => Err(Error::PropertyType(format!("{id:?} is {other:?}, not int")).record()),
        }
    }

    pub fn set_double3(
        &self,
        target: Arc<dyn Exposable>,
        id: PropertyId,
        value: [f64; 3],
    ) -> Result<()> {
        self.set_property(target, id, PropertyValue::Double3(value))
    }

    pub fn get_double3(&self, target: Arc<dyn Exposable>, id: PropertyId) -> Result<[f64; 3]> {
        match self.get_property(target, id)? {
            PropertyValue::Double3(v) => Ok(v),
            other => {
                Err(Error::PropertyType(format!("{id:?} is {other:?}, not double3")).record())
            }
        }
    }

    pub fn set_double6(
        &self,
        target: Arc<dyn Exposable>,
        id: PropertyId,
        value: [f64; 6],
    ) -> Result<()> {
        self.set_property(target, id, PropertyValue::Double6(value))
    }

    pub fn get_double6(&self, target: Arc<dyn Exposable>, id: PropertyId) -> Result<[f64; 6]> {
        match self.get_property(target, id)? {
            PropertyValue::Double6(v) => Ok(v),
            other => {
                Err(Error::PropertyType(format!("{id:?} is {other:?}, not double6")).record())
            }
        }
    }

    pub fn set_object(
        &self,
        target: Arc<dyn Exposable>,
        id: PropertyId,
        value: Option<Arc<dyn Exposable>>,
    ) -> Result<()> {
        self.set_property(target, id, PropertyValue::Object(value))
    }

    /// Establishes or retargets a routing edge between an output-capable
    /// object (a source) and an input-capable one (a global effect).
    pub fn route_configure(
        &self,
        output: Arc<dyn Exposable>,
        input: Arc<dyn Exposable>,
        gain: f64,
        fade_seconds: f64,
    ) -> Result<()> {
        let (output_id, input_id) = route_endpoints(&output, &input)?;
        if !(gain >= 0.0) {
            return Err(Error::InvalidArgument(format!("bad route gain {gain}")).record());
        }
        let fade_blocks = fade_to_blocks(fade_seconds)?;
        self.post_internal(move |audio| {
            audio
                .router
                .configure_route(output_id, input_id, gain, fade_blocks);
        })
    }

    /// Fades a routing edge to silence and collects it.
    pub fn route_remove(
        &self,
        output: Arc<dyn Exposable>,
        input: Arc<dyn Exposable>,
        fade_seconds: f64,
    ) -> Result<()> {
        let (output_id, input_id) = route_endpoints(&output, &input)?;
        let fade_blocks = fade_to_blocks(fade_seconds)?;
        self.post_internal(move |audio| {
            audio.router.remove_route(output_id, input_id, fade_blocks);
        })
    }

    /// Fades every edge originating at `output` to silence.
    pub fn route_remove_all(&self, output: Arc<dyn Exposable>, fade_seconds: f64) -> Result<()> {
        let output_id = output.output_endpoint().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "a {} cannot be the writing end of a route",
                output.kind_name()
            ))
            .record()
        })?;
        let fade_blocks = fade_to_blocks(fade_seconds)?;
        self.post_internal(move |audio| {
            audio.router.remove_all_routes(output_id, fade_blocks);
        })
    }

    /// Renders one block of `channels * BLOCK_SIZE` interleaved samples.
    ///
    /// This is the whole per-block sequence: drain property writes, drain
    /// commands, run sources into the panner bank and direct buffer, run
    /// routed effects, mix out, advance block time, collect deletions.
    pub fn generate_audio(&self, channels: usize, destination: &mut [f32]) -> Result<()> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(
                Error::InvalidArgument(format!("unsupported channel count {channels}")).record(),
            );
        }
        if destination.len() < channels * BLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "destination holds {} samples, need {}",
                destination.len(),
                channels * BLOCK_SIZE
            ))
            .record());
        }

        destination[..channels * BLOCK_SIZE].fill(0.0);
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.in_audio_callback.store(true, Ordering::Release);
        let _guard = CallbackFlagGuard(&self.in_audio_callback);

        let mut audio = self.audio.lock().unwrap();
        let block_time = self.block_time.load(Ordering::Acquire);

        // 1. Pending property writes, already validated.
        self.property_ring.apply_all();

        // 2. Commands, after properties so they see current parameters.
        self.commands.drain(COMMAND_RING_CAPACITY, &mut audio);

        let (pose, gain_update) = {
            let mut listener = self.listener.lock().unwrap();
            let update = listener.gain_changed.then_some(listener.gain);
            listener.gain_changed = false;
            (listener.pose, update)
        };

        let AudioState {
            router,
            panners,
            sources,
            effects,
            direct_buffer,
            gain_fader,
            deletion_rx,
            live_sources,
            live_effects,
        } = &mut *audio;

        if let Some(gain) = gain_update {
            gain_fader.set_value(block_time, gain);
        }

        // 3. Zero the direct mix buffer.
        direct_buffer.fill(0.0);

        // 4. Sources. Expired entries are dropped along with their edges.
        let mut live = std::mem::take(live_sources);
        sources.retain(|_, entry| match entry.source.upgrade() {
            Some(source) => {
                live.push(source);
                true
            }
            None => {
                router.unregister_output(entry.output);
                false
            }
        });
        for source in &live {
            source.run(channels, block_time, &pose, router, panners, direct_buffer);
        }
        live.clear();
        *live_sources = live;

        // 5. Panner bank renders every lane into the direct buffer.
        panners.run(channels, direct_buffer);

        // 6. Routed global effects.
        let mut live = std::mem::take(live_effects);
        effects.retain(|entry| match entry.effect.upgrade() {
            Some(effect) => {
                live.push((entry.input, effect));
                true
            }
            None => {
                router.unregister_input(entry.input);
                false
            }
        });
        for (input_id, effect) in &live {
            if let Some((input, input_channels)) = router.input_buffer(*input_id) {
                effect.run(block_time, input, input_channels, direct_buffer, channels);
            }
            router.clear_input(*input_id);
        }
        live.clear();
        *live_effects = live;
        router.finish_block();

        // 7. Mix the direct buffer to the output, applying context gain.
        gain_fader.drive(block_time, |gain| {
            for i in 0..BLOCK_SIZE {
                let g = gain(i);
                for ch in 0..channels {
                    destination[i * channels + ch] += direct_buffer[i * channels + ch] * g;
                }
            }
        });

        // 8. Advance block time; this is the consistency boundary.
        let next = block_time + 1;
        self.block_time.store(next, Ordering::Release);

        // 9. Collect deletions that have crossed their iteration boundary.
        deletion_rx.drain_ready(next, DELETION_DRAIN_LIMIT);

        Ok(())
    }

    /// Stops the audio thread, runs every queued command, and destroys
    /// everything pending. Idempotent; also invoked when the context's
    /// handle is freed and on drop.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        log::debug!("Context shutdown");

        // Dropping the output joins the device thread, after which nobody
        // else can be inside generate_audio.
        *self.output.lock().unwrap() = None;
        while self.in_audio_callback.load(Ordering::Acquire) {
            std::thread::yield_now();
        }

        self.deletion.begin_shutdown();

        let mut audio = self.audio.lock().unwrap();
        self.property_ring.apply_all();
        self.commands.drain(COMMAND_RING_CAPACITY, &mut audio);
        audio.deletion_rx.drain_all();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CallbackFlagGuard<'a>(&'a AtomicBool);

impl Drop for CallbackFlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn route_endpoints(
    output: &Arc<dyn Exposable>,
    input: &Arc<dyn Exposable>,
) -> Result<(OutputId, InputId)> {
    let output_id = output.output_endpoint().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "a {} cannot be the writing end of a route",
            output.kind_name()
        ))
        .record()
    })?;
    let input_id = input.input_endpoint().ok_or_else(|| {
        Error::InvalidArgument(format!(
            "a {} cannot be the reading end of a route",
            input.kind_name()
        ))
        .record()
    })?;
    Ok((output_id, input_id))
}

fn fade_to_blocks(fade_seconds: f64) -> Result<u64> {
    if !(fade_seconds >= 0.0) {
        return Err(Error::InvalidArgument(format!("bad fade time {fade_seconds}")).record());
    }
    let blocks = (fade_seconds * SR as f64 / BLOCK_SIZE as f64) as u64;
    // A nonzero fade shorter than one block still crossfades.
    if blocks == 0 && fade_seconds != 0.0 {
        return Ok(1);
    }
    Ok(blocks)
}

impl PropertyHost for Context {
    fn property_descriptors(&self) -> &'static [PropertyDescriptor] {
        CONTEXT_PROPERTIES
    }

    fn get_property(&self, id: PropertyId) -> Result<PropertyValue> {
        let listener = self.listener.lock().unwrap();
        match id {
            PropertyId::Gain => Ok(PropertyValue::Double(listener.gain)),
            PropertyId::Position => Ok(PropertyValue::Double3(listener.pose.position)),
            PropertyId::Orientation => Ok(PropertyValue::Double6(listener.pose.orientation)),
            other => Err(Error::PropertyDoesNotExist(format!("{other:?}"))),
        }
    }

    fn set_property(&self, id: PropertyId, value: PropertyValue) -> Result<()> {
        let mut listener = self.listener.lock().unwrap();
        match (id, value) {
            (PropertyId::Gain, PropertyValue::Double(v)) => {
                listener.gain = v;
                listener.gain_changed = true;
                Ok(())
            }
            (PropertyId::Position, PropertyValue::Double3(v)) => {
                listener.pose.position = v;
                Ok(())
            }
            (PropertyId::Orientation, PropertyValue::Double6(v)) => {
                listener.pose.orientation = v;
                Ok(())
            }
            (other, value) => Err(Error::PropertyType(format!(
                "cannot set {other:?} to {value:?}"
            ))),
        }
    }
}

impl Exposable for Context {
    fn handle_slot(&self) -> &HandleSlot {
        &self.handle
    }

    fn context_ref(&self) -> Option<Arc<Context>> {
        None
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn kind_name(&self) -> &'static str {
        "context"
    }

    fn on_handle_free(&self) {
        self.shutdown();
    }
}
