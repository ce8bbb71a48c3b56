//! The SID daemon binary: proxy process entry point.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sid::bridge::{accept_loop, bind, RequestHandler};
use sid::buffer::file::{FileBuffer, MappedFile};
use sid::config::DaemonConfig;
use sid::context::CommonContext;
use sid::keys::{Domain, Key, Namespace};
use sid::module::{DeviceHandle, ModuleRegistry};
use sid::proto::{Request, Response};
use sid::scan::ScanPipeline;
use sid::worker::{recv_with_fd_raw, WorkerPool};

/// Runs inside a freshly forked worker: scans `device` against the
/// (currently empty — module *loading* is out of scope) registry,
/// serializes every `SYNC`-flagged record the scan
/// produced into a `memfd`, and hands that fd back to the proxy over its
/// raw end of the worker channel. Only this process's copy-on-write copy of
/// `ctx` is ever mutated here; the real proxy-side store only changes once
/// [`sid::sync::apply_mapped_export`] merges the export buffer back in.
fn run_scan_worker(ctx: Arc<CommonContext>, device: DeviceHandle, channel_fd: std::os::fd::RawFd) -> i32 {
    let registry = ModuleRegistry::new();
    let outcome = ScanPipeline::new(ctx.clone(), &registry, device).run();
    let export = sid::sync::build_export_buffer(&ctx.store());

    let mut file_buf = match FileBuffer::create("sid-scan-export") {
        Ok(f) => f,
        Err(e) => {
            log::error!("scan worker: memfd create failed: {e}");
            return 1;
        }
    };
    if let Err(e) = file_buf.write_all(&export) {
        log::error!("scan worker: memfd write failed: {e}");
        return 1;
    }
    let status: u8 = if outcome.is_ok() { 0 } else { 1 };
    let fd = file_buf.into_owned_fd();
    if let Err(e) = sid::worker::send_with_fd_raw(channel_fd, &[status], fd.as_raw_fd()) {
        log::error!("scan worker: failed to hand back export buffer: {e}");
        return 1;
    }
    drop(fd);
    status as i32
}

/// Fork a scan worker for `device`, block until it reports back, and merge
/// its export buffer into the live store. Blocking here mirrors
/// the command state machine's own model: a `SCAN` request's
/// response only becomes `OK`/`ERROR` once the worker has actually finished.
fn dispatch_scan(pool: &Mutex<WorkerPool>, ctx: &Arc<CommonContext>, device: DeviceHandle, max_workers: usize) -> Response {
    // The pool lock only guards bookkeeping (spawn/remove); it is released
    // before the blocking receive below so concurrently dispatched SCANs can
    // each have their own worker in flight, up to `max_workers`.
    let (pid, recv_fd) = {
        let mut pool = pool.lock().expect("worker pool mutex poisoned");
        if pool.len() >= max_workers {
            return Response::error("worker pool exhausted, retry later");
        }
        let ctx_for_child = ctx.clone();
        let handle = match pool.spawn(move |channel_fd| run_scan_worker(ctx_for_child, device, channel_fd)) {
            Ok(h) => h,
            Err(e) => return Response::error(format!("failed to spawn scan worker: {e}")),
        };
        handle.assign();
        (handle.pid, handle.channel.as_raw_fd())
    };

    let recv_result = recv_with_fd_raw(recv_fd);
    let _ = nix::sys::wait::waitpid(pid, None);
    pool.lock().expect("worker pool mutex poisoned").remove(pid);

    let (_tag, body, maybe_fd) = match recv_result {
        Ok(v) => v,
        Err(e) => return Response::error(format!("scan worker channel error: {e}")),
    };
    let Some(export_fd) = maybe_fd else {
        return Response::error("scan worker returned no export buffer");
    };
    let mapped = match MappedFile::from_fd(export_fd) {
        Ok(m) => m,
        Err(e) => return Response::error(format!("failed to map export buffer: {e}")),
    };

    let report = sid::sync::apply_mapped_export(&mut ctx.store_mut(), &mapped);
    let applied = report
        .iter()
        .filter(|(_, outcome)| matches!(outcome, sid::sync::MergeOutcome::Applied | sid::sync::MergeOutcome::Unset))
        .count();
    let rejected = report.len() - applied;

    let worker_status = body.first().copied().unwrap_or(1);
    if worker_status != 0 {
        return Response::error(format!(
            "scan worker reported failure ({applied} record(s) still merged, {rejected} rejected)"
        ));
    }
    Response::ok(format!("scan complete: {applied} applied, {rejected} rejected").into_bytes())
}

/// Build the `RESOURCES` response body: one entry per
/// device that has ever had a `READY`/`RESERVED` state or group-membership
/// relation recorded, summarizing both the `#RDY`/`#RES` keys and the
/// `LYR:DEVICE:<mm>::GMB` hierarchy built by scan-pipeline `INIT`.
fn build_resource_tree(ctx: &CommonContext) -> serde_json::Value {
    use std::collections::BTreeMap;

    #[derive(Default, serde::Serialize)]
    struct DeviceResources {
        #[serde(skip_serializing_if = "Option::is_none")]
        ready: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reserved: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        group_members: Vec<String>,
    }

    let mut devices: BTreeMap<String, DeviceResources> = BTreeMap::new();
    for record in ctx.store().dump(false) {
        let Some(parsed) = Key::parse(&record.key) else { continue };
        if parsed.ns != Namespace::Device {
            continue;
        }
        let entry = devices.entry(parsed.ns_part.clone()).or_default();
        let sid::kv::DumpBody::Blob(blob) = &record.body else {
            if parsed.dom == Domain::Layer && parsed.core == "GMB" {
                if let sid::kv::DumpBody::Vector(members) = &record.body {
                    entry.group_members =
                        members.iter().map(|m| String::from_utf8_lossy(m).into_owned()).collect();
                }
            }
            continue;
        };
        match parsed.core.as_str() {
            sid::context::READY_KEY_CORE => entry.ready = Some(String::from_utf8_lossy(blob).into_owned()),
            sid::context::RESERVED_KEY_CORE => entry.reserved = Some(String::from_utf8_lossy(blob).into_owned()),
            _ => {}
        }
    }
    serde_json::json!(devices)
}

fn handle_request(
    request: Request,
    ctx: Arc<CommonContext>,
    pool: Arc<Mutex<WorkerPool>>,
    max_workers: usize,
    db_path: &std::path::Path,
) -> Response {
    match request.command.as_str() {
        "ACTIVE" => Response::ok(format!("boot_id={}", ctx.boot_id()).into_bytes()),
        "VERSION" => Response::ok(sid::VERSION.as_bytes().to_vec()),
        "DBSTATS" => {
            let size = ctx.store().size();
            let body = format!(
                "records={} meta_bytes={} value_bytes={}",
                size.record_count, size.meta_bytes, size.value_bytes
            );
            Response::ok(body.into_bytes())
        }
        "DBDUMP" => {
            let dump = ctx.store().dump(false);
            match serde_json::to_vec(&dump) {
                Ok(body) => Response::ok(body),
                Err(e) => Response::error(format!("failed to encode DBDUMP: {e}")),
            }
        }
        "RESOURCES" => {
            let tree = build_resource_tree(&ctx);
            match serde_json::to_vec(&tree) {
                Ok(body) => Response::ok(body),
                Err(e) => Response::error(format!("failed to encode RESOURCES: {e}")),
            }
        }
        "CHECKPOINT" => checkpoint(&ctx, db_path),
        "DBRESTORE" => restore(&ctx, db_path),
        "SCAN" => match serde_json::from_slice::<DeviceHandle>(&request.payload) {
            Ok(device) => dispatch_scan(&pool, &ctx, device, max_workers),
            Err(e) => Response::error(format!("malformed SCAN payload: {e}")),
        },
        other => Response::error(format!("unknown command {other}")),
    }
}

/// `CHECKPOINT`, the one on-disk durability exception. Writes
/// every `PERSISTENT`-flagged record to [`DaemonConfig::db_path`] as a JSON
/// snapshot (`persist::write_snapshot`). Without the `persistence` feature
/// there is no on-disk format to write to, so the command fails cleanly
/// rather than silently discarding the request.
#[cfg(feature = "persistence")]
fn checkpoint(ctx: &CommonContext, db_path: &std::path::Path) -> Response {
    match sid::persist::write_snapshot(&ctx.store(), ctx.current_generation(), db_path) {
        Ok(count) => Response::ok(format!("checkpoint written: {count} record(s) to {}", db_path.display()).into_bytes()),
        Err(e) => Response::error(format!("checkpoint failed: {e}")),
    }
}

#[cfg(not(feature = "persistence"))]
fn checkpoint(_ctx: &CommonContext, _db_path: &std::path::Path) -> Response {
    Response::error("CHECKPOINT requires the `persistence` feature")
}

/// `DBRESTORE`, the load half of `CHECKPOINT`.
/// Replaces every record the snapshot names; anything the live store holds
/// outside the snapshot is left untouched.
#[cfg(feature = "persistence")]
fn restore(ctx: &CommonContext, db_path: &std::path::Path) -> Response {
    match sid::persist::read_snapshot(&mut ctx.store_mut(), db_path) {
        Ok(count) => Response::ok(format!("restored {count} record(s) from {}", db_path.display()).into_bytes()),
        Err(e) => Response::error(format!("restore failed: {e}")),
    }
}

#[cfg(not(feature = "persistence"))]
fn restore(_ctx: &CommonContext, _db_path: &std::path::Path) -> Response {
    Response::error("DBRESTORE requires the `persistence` feature")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = DaemonConfig::from_env();
    log::info!("sid starting, socket={:?} max_workers={}", config.socket_path, config.max_workers);

    let ctx = Arc::new(CommonContext::new(uuid::Uuid::new_v4()));
    let pool = Arc::new(Mutex::new(WorkerPool::new(config.worker_timeout)));
    let max_workers = config.max_workers;
    let db_path: PathBuf = config.db_path.clone();
    let listener = bind(&config.socket_path)?;
    let handler: RequestHandler = Arc::new(move |request, ctx| {
        handle_request(request, ctx, pool.clone(), max_workers, &db_path)
    });

    accept_loop(listener, ctx, handler).await?;
    Ok(())
}
