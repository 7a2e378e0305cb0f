use std::sync::Arc;

use chrono::{DateTime, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam::channel::{unbounded, Receiver};
use parking_lot::Mutex;
use rust_microscope::camera::{Frame, PixelBuffer, Transform};
use rust_microscope::data::client::{Client, Payload};
use rust_microscope::data::{DataDevice, DataDriver, SampleSink};
use rust_microscope::device::Driver;
use rust_microscope::error::DeviceResult;

/// Callback-mode source; the benchmark pushes samples through its sink.
#[derive(Default)]
struct Source {
    sink: Mutex<Option<SampleSink<u64>>>,
}

impl Driver for Source {
    fn do_shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }
}

impl DataDriver for Source {
    type Sample = u64;

    fn abort(&self) -> DeviceResult<()> {
        Ok(())
    }

    fn uses_callback(&self) -> bool {
        true
    }

    fn attach_sink(&self, sink: SampleSink<u64>) {
        *self.sink.lock() = Some(sink);
    }
}

fn enabled_source() -> (DataDevice<Source>, SampleSink<u64>, Receiver<(Payload<u64>, DateTime<Utc>)>) {
    let device = DataDevice::new(Source::default()).expect("construct source");
    let (tx, rx) = unbounded();
    let client: Arc<dyn Client<u64>> = Arc::new(tx);
    device
        .set_client(Some(client.into()))
        .expect("install client");
    device.enable().expect("enable source");
    let sink = device.driver().sink.lock().clone().expect("sink attached");
    (device, sink, rx)
}

fn benchmark_dispatch(c: &mut Criterion) {
    let (device, sink, rx) = enabled_source();
    let mut group = c.benchmark_group("dispatch");
    for count in [1_000u64, 10_000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                for n in 0..count {
                    sink.push(n);
                }
                for _ in 0..count {
                    black_box(rx.recv().expect("sample delivered"));
                }
            });
        });
    }
    group.finish();
    device.shutdown();
}

fn benchmark_frame_transform(c: &mut Criterion) {
    let frame = Frame::new(512, 512, PixelBuffer::U16(vec![7; 512 * 512])).expect("frame");
    let mut group = c.benchmark_group("frame_transform");
    for transform in [
        Transform::new(true, false, false),
        Transform::new(false, false, true),
        Transform::new(true, true, true),
    ] {
        group.bench_function(transform.to_string(), |b| {
            b.iter(|| black_box(frame.clone().transformed(transform)));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_dispatch, benchmark_frame_transform);
criterion_main!(benches);
