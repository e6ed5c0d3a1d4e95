//! Routing walkthrough.
//!
//! Plays a music stream, plugs in a headset, connects a Bluetooth headset,
//! rings an alarm, then places a call while one hands-free peer refuses to
//! activate, printing every routing event along the way.
//!
//! Run with: RUST_LOG=audio_route_core=debug cargo run --example route_walkthrough

use std::sync::Arc;

use audio_route_core::mock::{MockBluetooth, MockHdiAdapter, MockStreamCollector};
use audio_route_core::{
    AudioCoreServiceBuilder, DeviceDescriptor, DeviceRole, DeviceType, StreamDescriptor, StreamInfo, StreamUsage,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let hdi = Arc::new(MockHdiAdapter::new());
    let bluetooth = Arc::new(MockBluetooth::new());
    let core = AudioCoreServiceBuilder::new()
        .hdi_adapter(hdi.clone())
        .bluetooth(bluetooth.clone())
        .stream_collector(Arc::new(MockStreamCollector::new()))
        .on_event(|e| println!("event: {e:?}"))
        .spawn()
        .await?;

    let music = StreamDescriptor::renderer(StreamUsage::Music, StreamInfo::default()).with_app(20_010, 300);
    let music = core.create_renderer_client(music).await?;
    core.start_client(music.session_id).await?;
    println!("music on {}", core.service().active_devices().current_output_device());

    core.on_device_connected(DeviceDescriptor::new(DeviceType::WiredHeadset, DeviceRole::Output))
        .await?;
    println!("after headset: {}", core.service().active_devices().current_output_device());

    let buds = DeviceDescriptor::new(DeviceType::BluetoothA2dp, DeviceRole::Output)
        .with_mac("12:34:56:78:9a:bc")
        .with_name("buds");
    core.on_device_connected(buds).await?;
    println!("after buds: {}", core.service().active_devices().current_output_device());

    let alarm = StreamDescriptor::renderer(StreamUsage::Alarm, StreamInfo::default()).with_app(20_020, 310);
    let alarm = core.create_renderer_client(alarm).await?;
    core.start_client(alarm.session_id).await?;
    println!("dual tone owner: {:?}", core.service().dual_tone_session());

    core.release_client(alarm.session_id).await?;

    let broken = DeviceDescriptor::new(DeviceType::BluetoothSco, DeviceRole::Output).with_mac("aa:aa:aa:aa:aa:01");
    let working = DeviceDescriptor::new(DeviceType::BluetoothSco, DeviceRole::Output).with_mac("aa:aa:aa:aa:aa:02");
    bluetooth.fail_mac(&broken.mac_address);
    core.on_device_connected(working).await?;
    core.on_device_connected(broken).await?;
    let call = StreamDescriptor::renderer(StreamUsage::VoiceCommunication, StreamInfo::default()).with_app(20_030, 320);
    let call = core.create_renderer_client(call).await?;
    core.start_client(call.session_id).await?;
    println!("call on {}", core.service().active_devices().current_output_device());

    core.release_client(call.session_id).await?;
    core.release_client(music.session_id).await?;

    println!("{}", core.service().dump());
    println!("hal calls: {}", hdi.calls().len());
    core.stop().await;
    Ok(())
}
