// Jackson Coxson
//
// Samples CPU/memory/FPS for a running process, the way the reference
// client's sysmontap + opengl demo does, but driven by a concurrent
// `RpcSession` instead of a synchronous RPC loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use devscope::config::Config;
use devscope::error::{Error, Result};
use devscope::instruments::{AuxValue, RpcSession};
use devscope::lockdown::{pairing, store, LockdownClient, LOCKDOWND_PORT};
use devscope::mux::MuxClient;

const CLIENT_VERSION: &str = "devscope-sysmon-demo";
const SYSMONTAP: &str = "com.apple.instruments.server.services.sysmontap";
const OPENGL: &str = "com.apple.instruments.server.services.graphics.opengl";
const INSTRUMENTS_SERVICE_NAMES: &[&str] = &[
    "com.apple.instruments.remoteserver",
    "com.apple.instruments.remoteserver.DVTSecureSocketProxy",
];

#[derive(Default)]
struct Profiler {
    cpu_usage: f64,
    pss_mem_mb: f64,
    virtual_mem_gb: f64,
    fps: f64,
}

fn sysmon_config() -> plist::Value {
    let mut dict = plist::Dictionary::new();
    dict.insert("ur".into(), 1000i64.into());
    dict.insert("bm".into(), 0i64.into());
    dict.insert("cpuUsage".into(), true.into());
    dict.insert("sampleInterval".into(), 1_000_000_000i64.into());
    dict.insert(
        "procAttrs".into(),
        plist::Value::Array(
            ["pid", "memResidentSize", "cpuUsage", "physFootprint", "memVirtualSize"]
                .iter()
                .map(|s| plist::Value::String(s.to_string()))
                .collect(),
        ),
    );
    dict.insert("sysAttrs".into(), plist::Value::Array(Vec::new()));
    plist::Value::Dictionary(dict)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let pid: u32 = args
        .next()
        .expect("usage: sysmon-demo <pid> [udid]")
        .parse()
        .expect("pid must be a number");
    let udid = args.next();

    let config = Config::new("devscope-sysmon-demo");
    config.apply_mux_override();

    let device = devscope::mux::find_device(
        CLIENT_VERSION,
        &config.program_name,
        udid.as_deref(),
        Duration::from_millis(500),
        10,
    )
    .await?;

    let mux = MuxClient::connect(CLIENT_VERSION, &config.program_name).await?;
    let socket = mux.connect_to_device(device.device_id, LOCKDOWND_PORT).await?;
    let mut lockdown = LockdownClient::connect(socket, CLIENT_VERSION).await?;

    let product_version = lockdown.product_version().await.ok();
    let ios_major = product_version
        .as_deref()
        .and_then(|v| v.split('.').next())
        .and_then(|m| m.parse::<u8>().ok());

    let identifier = device.serial.clone();
    let mut pair_record_mux = MuxClient::connect(CLIENT_VERSION, &config.program_name).await?;
    let existing =
        store::load_pair_record(&identifier, &mut pair_record_mux, ios_major, &config.program_name).await?;

    let program_name = config.program_name.clone();
    let (mut lockdown, pairing_file) = pairing::pair(
        lockdown,
        existing,
        &config.host_id,
        &config.system_buid,
        || async {
            let mux = MuxClient::connect(CLIENT_VERSION, &program_name).await?;
            let socket = mux.connect_to_device(device.device_id, LOCKDOWND_PORT).await?;
            LockdownClient::connect(socket, CLIENT_VERSION).await
        },
        |pf| store::store_pair_record(pf.clone(), &identifier, &config.program_name),
    )
    .await?;

    let mut last_err = None;
    let mut instruments_socket = None;
    for name in INSTRUMENTS_SERVICE_NAMES {
        match lockdown.start_service(name, None).await {
            Ok((port, ssl)) => {
                let mux = MuxClient::connect(CLIENT_VERSION, &config.program_name).await?;
                let socket = mux.connect_to_device(device.device_id, port).await?;
                instruments_socket = Some((socket, ssl));
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let (socket, needs_tls) = instruments_socket.ok_or_else(|| {
        last_err.unwrap_or(Error::UnexpectedResponse)
    })?;

    let socket: Box<dyn devscope::ReadWrite> = if needs_tls {
        let mut link = devscope::DeviceLink::new(socket, CLIENT_VERSION.to_string());
        link.start_tls(&pairing_file, false).await?;
        link.into_socket().ok_or(Error::TransportBroken)?
    } else {
        socket
    };

    let session = RpcSession::start(socket);
    let profiler = Arc::new(Mutex::new(Profiler::default()));

    {
        let profiler = profiler.clone();
        session
            .register_channel_callback(OPENGL, move |message| {
                let Some(fps) = message
                    .data
                    .as_ref()
                    .and_then(|v| v.as_dictionary())
                    .and_then(|d| d.get("CoreAnimationFramesPerSecond"))
                    .and_then(|v| v.as_real().or_else(|| v.as_signed_integer().map(|i| i as f64)))
                else {
                    return;
                };
                profiler.lock().expect("profiler mutex poisoned").fps = fps;
            })
            .await?;
    }

    {
        let profiler = profiler.clone();
        session
            .register_channel_callback(SYSMONTAP, move |message| {
                let Some(entries) = message.data.as_ref().and_then(|v| v.as_array()) else {
                    return;
                };
                for entry in entries {
                    let Some(processes) = entry
                        .as_dictionary()
                        .and_then(|d| d.get("Processes"))
                        .and_then(|v| v.as_dictionary())
                    else {
                        continue;
                    };
                    let Some(info) = processes
                        .get(&pid.to_string())
                        .and_then(|v| v.as_array())
                    else {
                        continue;
                    };
                    let mut profiler = profiler.lock().expect("profiler mutex poisoned");
                    if let Some(cpu) = info.get(1).and_then(|v| v.as_real()) {
                        profiler.cpu_usage = cpu;
                    }
                    if let Some(phys) = info.get(12).and_then(|v| v.as_signed_integer()) {
                        profiler.pss_mem_mb = phys as f64 / 1024.0 / 1024.0;
                    }
                    if let Some(virt) = info.first().and_then(|v| v.as_signed_integer()) {
                        profiler.virtual_mem_gb = virt as f64 / 1024.0 / 1024.0 / 1024.0;
                    }
                }
            })
            .await?;
    }

    session
        .call(SYSMONTAP, "setConfig:", vec![AuxValue::archived_value(sysmon_config())])
        .await?;
    session.call(SYSMONTAP, "start", vec![]).await?;
    session
        .call(OPENGL, "startSamplingAtTimeInterval:", vec![AuxValue::I64(10)])
        .await?;

    for _ in 0..200 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let p = profiler.lock().expect("profiler mutex poisoned");
        println!(
            "cpu={:.1} mem={:.1}MB vmem={:.2}GB fps={:.0}",
            p.cpu_usage, p.pss_mem_mb, p.virtual_mem_gb, p.fps
        );
    }

    session.stop().await;

    Ok(())
}
