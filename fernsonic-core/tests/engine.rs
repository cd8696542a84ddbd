//! End-to-end pipeline tests against a headless context.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fernsonic_core::config::{BLOCK_SIZE, COMMAND_RING_CAPACITY};
use fernsonic_core::{
    Buffer, BufferGenerator, Context, EchoTapConfig, Error, EventKind, Exposable, Generator,
    GlobalEcho, HandleSlot, HandleTable, PropertyDescriptor, PropertyHost, PropertyId,
    PropertyValue, Result, Source,
};

/// Emits a constant value on a fixed channel count and counts invocations.
struct ConstantGenerator {
    context: Arc<Context>,
    handle: HandleSlot,
    channels: usize,
    value: f32,
    runs: AtomicUsize,
}

impl ConstantGenerator {
    fn new(context: &Arc<Context>, channels: usize, value: f32) -> Arc<Self> {
        Arc::new(Self {
            context: context.clone(),
            handle: HandleSlot::new(),
            channels,
            value,
            runs: AtomicUsize::new(0),
        })
    }
}

impl PropertyHost for ConstantGenerator {
    fn property_descriptors(&self) -> &'static [PropertyDescriptor] {
        &[]
    }

    fn get_property(&self, id: PropertyId) -> Result<PropertyValue> {
        Err(Error::PropertyDoesNotExist(format!("{id:?}")))
    }

    fn set_property(&self, id: PropertyId, _value: PropertyValue) -> Result<()> {
        Err(Error::PropertyDoesNotExist(format!("{id:?}")))
    }
}

impl Exposable for ConstantGenerator {
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
        "constant_generator"
    }
}

impl Generator for ConstantGenerator {
    fn channels(&self) -> usize {
        self.channels
    }

    fn run(&self, _block_time: u64, output: &mut [f32]) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for sample in output[..self.channels * BLOCK_SIZE].iter_mut() {
            *sample += self.value;
        }
    }
}

fn render(context: &Arc<Context>, channels: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; channels * BLOCK_SIZE];
    context.generate_audio(channels, &mut out).unwrap();
    out
}

#[test]
fn test_silent_pipeline() {
    let context = Context::new_headless(2).unwrap();
    let mut total = Vec::new();
    for _ in 0..10 {
        total.extend(render(&context, 2));
    }
    assert_eq!(total.len(), 10 * 256 * 2);
    assert!(total.iter().all(|&s| s == 0.0));
    assert_eq!(context.block_time(), 10);
}

#[test]
fn test_block_time_advances_by_one() {
    let context = Context::new_headless(2).unwrap();
    for expected in 0..5 {
        assert_eq!(context.block_time(), expected);
        render(&context, 2);
        assert_eq!(context.block_time(), expected + 1);
    }
}

#[test]
fn test_pass_through_source_upmixes_mono() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 0.25);
    source
        .add_generator(&(generator.clone() as Arc<dyn Generator>))
        .unwrap();

    let out = render(&context, 2);
    assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-7));
    assert_eq!(generator.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_gain_crossfade_is_linear_over_one_block() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 1.0);
    source
        .add_generator(&(generator as Arc<dyn Generator>))
        .unwrap();

    let out = render(&context, 2);
    assert!(out.iter().all(|&s| s == 1.0));

    context
        .set_double(source.clone(), PropertyId::Gain, 0.0)
        .unwrap();
    let out = render(&context, 2);
    for i in 0..BLOCK_SIZE {
        let expected = (BLOCK_SIZE - 1 - i) as f32 / BLOCK_SIZE as f32;
        assert_eq!(out[i * 2], expected, "frame {i} left");
        assert_eq!(out[i * 2 + 1], expected, "frame {i} right");
    }

    let out = render(&context, 2);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn test_repeated_same_value_set_has_no_discontinuity() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 1.0);
    source
        .add_generator(&(generator as Arc<dyn Generator>))
        .unwrap();
    render(&context, 2);

    context
        .set_double(source.clone(), PropertyId::Gain, 1.0)
        .unwrap();
    context
        .set_double(source.clone(), PropertyId::Gain, 1.0)
        .unwrap();
    let out = render(&context, 2);
    assert!(out.iter().all(|&s| s == 1.0));
}

#[test]
fn test_handle_lifecycle_defers_destruction() {
    let context = Context::new_headless(2).unwrap();
    let handles = HandleTable::new();

    let buffer = Buffer::from_interleaved(1, &vec![0.1f32; 1024]).unwrap();
    let generator = BufferGenerator::new(&context);
    context
        .set_object(
            generator.clone(),
            PropertyId::Buffer,
            Some(buffer.clone() as Arc<dyn Exposable>),
        )
        .unwrap();
    // Apply the pending property write so the generator owns the buffer.
    render(&context, 2);

    let generator_handle = handles.register(generator.clone());
    let generator_weak = Arc::downgrade(&generator);
    let buffer_weak = Arc::downgrade(&buffer);
    drop(generator);
    drop(buffer);

    handles.free(generator_handle).unwrap();

    // Block 1 after the free: the deletion record is not due yet.
    render(&context, 2);
    assert!(generator_weak.upgrade().is_some());
    assert!(buffer_weak.upgrade().is_some());

    // Block 2: the record crosses its iteration boundary and both objects
    // go down together, exactly once each.
    render(&context, 2);
    assert!(generator_weak.upgrade().is_none());
    assert!(buffer_weak.upgrade().is_none());

    assert_eq!(handles.free(generator_handle), Err(Error::InvalidHandle));
}

#[test]
fn test_property_validation_rejects_before_the_boundary() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    render(&context, 2);

    let err = context
        .set_double(source.clone(), PropertyId::Gain, -1.0)
        .unwrap_err();
    assert!(matches!(err, Error::Range(_)));
    assert!(fernsonic_core::last_error_message().is_some());

    render(&context, 2);
    assert_eq!(
        context.get_double(source.clone(), PropertyId::Gain).unwrap(),
        1.0
    );
}

#[test]
fn test_property_write_visible_after_barrier() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    context
        .set_double(source.clone(), PropertyId::Gain, 0.5)
        .unwrap();
    render(&context, 2);
    assert_eq!(
        context.get_double(source.clone(), PropertyId::Gain).unwrap(),
        0.5
    );
}

#[test]
fn test_command_ring_saturation_recovers() {
    let context = Context::new_headless(2).unwrap();
    for _ in 0..COMMAND_RING_CAPACITY {
        context.post(|| {}).unwrap();
    }
    let err = context.post(|| {}).unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));

    render(&context, 2);
    context.post(|| {}).unwrap();
}

#[test]
fn test_add_then_remove_generator_in_one_block_never_runs_it() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 1.0);
    let as_dyn = generator.clone() as Arc<dyn Generator>;

    source.add_generator(&as_dyn).unwrap();
    source.remove_generator(&as_dyn).unwrap();

    let out = render(&context, 2);
    assert_eq!(generator.runs.load(Ordering::SeqCst), 0);
    assert!(out.iter().all(|&s| s == 0.0));
}

#[test]
fn test_pause_fades_out_then_holds_silent() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 1.0);
    source
        .add_generator(&(generator as Arc<dyn Generator>))
        .unwrap();
    render(&context, 2);

    source.pause().unwrap();
    let fading = render(&context, 2);
    assert_eq!(fading[0], (BLOCK_SIZE - 1) as f32 / BLOCK_SIZE as f32);
    let silent = render(&context, 2);
    assert!(silent.iter().all(|&s| s == 0.0));

    source.play().unwrap();
    let fading_in = render(&context, 2);
    assert!(fading_in[0] < 0.1);
    let playing = render(&context, 2);
    assert!(playing.iter().all(|&s| s == 1.0));
}

#[test]
fn test_routed_echo_contributes_to_mix() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 0.5);
    source
        .add_generator(&(generator as Arc<dyn Generator>))
        .unwrap();

    let echo = GlobalEcho::new(&context).unwrap();
    echo.set_taps(&[EchoTapConfig {
        delay_seconds: 0.0,
        gain_l: 1.0,
        gain_r: 1.0,
    }])
    .unwrap();
    context
        .route_configure(source.clone(), echo.clone(), 1.0, 0.0)
        .unwrap();

    // The new tap set crossfades in from silence over its first block; let
    // that settle, then the mix is the direct contribution (0.5) plus the
    // echo's zero-delay tap (0.5).
    render(&context, 2);
    let out = render(&context, 2);
    assert!(out.iter().all(|&s| (s - 1.0).abs() < 1e-6));

    // After removing the route the echo input goes silent again.
    context
        .route_remove(source.clone(), echo.clone(), 0.0)
        .unwrap();
    let out = render(&context, 2);
    assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
}

#[test]
fn test_route_rejects_objects_without_endpoints() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = BufferGenerator::new(&context);
    let err = context
        .route_configure(generator.clone(), source.clone(), 1.0, 0.0)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_buffer_generator_emits_finished_once() {
    let context = Context::new_headless(2).unwrap();
    let handles = HandleTable::new();
    let source = Source::new_direct(&context).unwrap();
    let generator = BufferGenerator::new(&context);
    let generator_handle = handles.register(generator.clone());

    // Shorter than one block, non-looping.
    let buffer = Buffer::from_interleaved(1, &vec![0.3f32; 64]).unwrap();
    context
        .set_object(
            generator.clone(),
            PropertyId::Buffer,
            Some(buffer as Arc<dyn Exposable>),
        )
        .unwrap();
    source
        .add_generator(&(generator.clone() as Arc<dyn Generator>))
        .unwrap();

    render(&context, 2);
    let event = context.poll_event().unwrap();
    assert_eq!(event.kind, EventKind::Finished);
    assert_eq!(event.source, generator_handle);

    render(&context, 2);
    assert!(context.poll_event().is_none());
}

#[test]
fn test_buffer_generator_loops_and_emits_looped() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = BufferGenerator::new(&context);
    let buffer = Buffer::from_interleaved(1, &vec![0.25f32; 128]).unwrap();
    context
        .set_object(
            generator.clone(),
            PropertyId::Buffer,
            Some(buffer as Arc<dyn Exposable>),
        )
        .unwrap();
    context
        .set_int(generator.clone(), PropertyId::Looping, 1)
        .unwrap();
    source
        .add_generator(&(generator.clone() as Arc<dyn Generator>))
        .unwrap();

    // A 128-frame buffer into a 256-frame block wraps mid-block; the block
    // is seamless and a loop event is queued.
    let out = render(&context, 2);
    assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    assert_eq!(context.poll_event().unwrap().kind, EventKind::Looped);
    assert!(context.poll_event().is_none());

    // Looping keeps going block after block. The wrap deferred at the first
    // block boundary lands here along with this block's own mid-block wrap,
    // so exactly two loop events are queued.
    let out = render(&context, 2);
    assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    assert_eq!(context.poll_event().unwrap().kind, EventKind::Looped);
    assert_eq!(context.poll_event().unwrap().kind, EventKind::Looped);
    assert!(context.poll_event().is_none());
}

#[test]
fn test_panned_source_renders_through_lane() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_panned(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 1.0);
    source
        .add_generator(&(generator as Arc<dyn Generator>))
        .unwrap();
    context
        .set_double(source.clone(), PropertyId::PanningScalar, 1.0)
        .unwrap();

    // Let the pan-change crossfade settle, then inspect a steady block.
    render(&context, 2);
    let out = render(&context, 2);
    let frame = BLOCK_SIZE - 1;
    assert!(out[frame * 2].abs() < 1e-6, "left should be silent");
    assert!(out[frame * 2 + 1] > 0.9, "right should carry the signal");
}

#[test]
fn test_3d_source_attenuates_with_distance() {
    let context = Context::new_headless(2).unwrap();
    let near = Source::new_3d(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 1.0);
    near.add_generator(&(generator.clone() as Arc<dyn Generator>))
        .unwrap();

    context
        .set_double3(near.clone(), PropertyId::Position, [0.0, 1.0, 0.0])
        .unwrap();
    render(&context, 2);
    let close = render(&context, 2);
    let close_energy: f32 = close.iter().map(|s| s.abs()).sum();

    context
        .set_double3(near.clone(), PropertyId::Position, [0.0, 40.0, 0.0])
        .unwrap();
    render(&context, 2);
    let far = render(&context, 2);
    let far_energy: f32 = far.iter().map(|s| s.abs()).sum();

    assert!(close_energy > 0.0);
    assert!(far_energy < close_energy * 0.5);
}

#[test]
fn test_handle_type_mismatch() {
    let context = Context::new_headless(2).unwrap();
    let handles = HandleTable::new();
    let source = Source::new_direct(&context).unwrap();
    let handle = handles.register(source);

    assert!(handles.get::<Source>(handle).is_ok());
    let err = handles.get::<Buffer>(handle).unwrap_err();
    assert!(matches!(err, Error::HandleType(_)));
    assert_eq!(handles.get::<Source>(9999).unwrap_err(), Error::InvalidHandle);
}

#[test]
fn test_shutdown_is_idempotent_and_silences_output() {
    let context = Context::new_headless(2).unwrap();
    let source = Source::new_direct(&context).unwrap();
    let generator = ConstantGenerator::new(&context, 1, 1.0);
    source
        .add_generator(&(generator as Arc<dyn Generator>))
        .unwrap();
    render(&context, 2);

    context.shutdown();
    context.shutdown();
    let out = render(&context, 2);
    assert!(out.iter().all(|&s| s == 0.0));
}
