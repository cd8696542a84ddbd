//! Plays a looping tone on a 3D source orbiting the listener.

use std::sync::Arc;
use std::time::Duration;

use fernsonic_core::{
    Buffer, BufferGenerator, Context, Exposable, Generator, PropertyId, Source,
};

fn main() -> fernsonic_core::Result<()> {
    env_logger::init();

    let context = Context::new_with_device(2)?;

    // One second of a 220 Hz sine.
    let samples: Vec<f32> = (0..fernsonic_core::config::SR)
        .map(|i| {
            let t = i as f32 / fernsonic_core::config::SR as f32;
            (t * 220.0 * std::f32::consts::TAU).sin() * 0.4
        })
        .collect();
    let buffer = Buffer::from_interleaved(1, &samples)?;

    let generator = BufferGenerator::new(&context);
    context.set_object(
        generator.clone(),
        PropertyId::Buffer,
        Some(buffer as Arc<dyn Exposable>),
    )?;
    context.set_int(generator.clone(), PropertyId::Looping, 1)?;

    let source = Source::new_3d(&context)?;
    source.add_generator(&(generator as Arc<dyn Generator>))?;

    for step in 0..400 {
        let angle = step as f64 * 0.05;
        let position = [3.0 * angle.sin(), 3.0 * angle.cos(), 0.0];
        context.set_double3(source.clone(), PropertyId::Position, position)?;
        std::thread::sleep(Duration::from_millis(25));
    }

    context.shutdown();
    Ok(())
}
