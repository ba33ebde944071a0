//! End-to-end tests: JSON lines in, JSON lines out, with the Arch driver
//! running a shell script in place of mkarchiso.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use distroforge::dispatch::Dispatcher;
use distroforge::drivers::arch::{ArchDriver, ArchPaths, BuildSettings};
use distroforge::output::OutputSink;
use distroforge::plugin::PluginRegistry;
use distroforge::protocol::{
    BUILD_IN_PROGRESS, BUILD_NOT_FOUND, INVALID_PARAMS, PLUGIN_NOT_FOUND, PROJECT_NOT_FOUND,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Writes three log lines, then drops an image where mkarchiso would.
/// `$5` is the `-o` directory, named after the project.
const BUILD_OK: &str = r#"for i in 1 2 3; do echo "step $i"; sleep 0.1; done; touch "$5/archlinux-$(basename "$5")-2024.01.01-x86_64.iso""#;
const BUILD_FAILS: &str = "echo 'error: failed to install packages' >&2; exit 3";
const BUILD_HANGS: &str = "echo started; sleep 30";

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Engine {
    _tmp: TempDir,
    dispatcher: Dispatcher,
    out: SharedBuf,
    next_id: AtomicU64,
}

impl Engine {
    fn with_build_script(script: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let arch = ArchDriver::new(
            ArchPaths {
                projects_root: root.join("projects"),
                isos_root: root.join("isos"),
                work_root: root.join("work/archiso"),
            },
            BuildSettings {
                tool: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                    "mkarchiso".to_string(),
                ],
                log_poll_interval: Duration::from_millis(20),
                download_base: "/isos".to_string(),
            },
        )
        .unwrap();

        let mut plugins = PluginRegistry::new();
        plugins.register("arch", Arc::new(arch)).unwrap();
        let out = SharedBuf::default();
        Engine {
            _tmp: tmp,
            dispatcher: Dispatcher::new(plugins, OutputSink::new(out.clone())),
            out,
            next_id: AtomicU64::new(1),
        }
    }

    fn lines(&self) -> Vec<Value> {
        let bytes = self.out.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).expect("every output line is one JSON document"))
            .collect()
    }

    /// Send one request line and return its response.
    fn call(&self, method: &str, params: Value) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id});
        self.dispatcher.serve_line(&line.to_string()).unwrap();
        self.lines()
            .into_iter()
            .find(|line| line["id"] == id)
            .expect("response written before serve_line returns")
    }

    fn ok(&self, method: &str, params: Value) -> Value {
        let response = self.call(method, params);
        assert!(response.get("error").is_none(), "{method} failed: {response}");
        response["result"].clone()
    }

    fn error_code(&self, method: &str, params: Value) -> i64 {
        let response = self.call(method, params);
        response["error"]["code"]
            .as_i64()
            .unwrap_or_else(|| panic!("{method} unexpectedly succeeded: {response}"))
    }

    fn create_arch_project(&self) -> String {
        self.ok("engine.createProject", json!({"distro_id": "arch"}))["project_id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn wait_for_terminal(&self, project_id: &str, build_id: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let status = self.ok(
                "project.getBuildStatus",
                json!({"project_id": project_id, "build_id": build_id}),
            );
            if status["status"] == "completed" || status["status"] == "failed" {
                return status;
            }
            assert!(Instant::now() < deadline, "build {build_id} never finished");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Notifications for one build, waiting until its stream_end marker.
    fn wait_for_stream_end(&self, build_id: &str) -> Vec<Value> {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let notifications: Vec<Value> = self
                .lines()
                .into_iter()
                .filter(|line| line["id"].is_null() && line["result"]["build_id"] == build_id)
                .map(|line| line["result"].clone())
                .collect();
            if notifications.iter().any(|n| n["stream_end"] == true) {
                return notifications;
            }
            assert!(Instant::now() < deadline, "stream for {build_id} never ended");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

#[test]
fn arch_project_builds_to_completion() {
    let engine = Engine::with_build_script(BUILD_OK);
    let project = engine.create_arch_project();

    assert_eq!(
        engine.ok(
            "project.setPackages",
            json!({"project_id": project, "packages": ["base", "linux"]})
        ),
        json!({"success": true})
    );
    assert_eq!(
        engine.ok("project.getPackages", json!({"project_id": project})),
        json!({"packages": ["base", "linux"]})
    );

    let ticket = engine.ok("project.buildIso", json!({"project_id": project}));
    assert_eq!(ticket["status"], "building");
    let build_id = ticket["build_id"].as_str().unwrap().to_string();

    let status = engine.wait_for_terminal(&project, &build_id);
    assert_eq!(status["status"], "completed", "{status}");
    assert_eq!(status["progress"], 100);
    let url = status["download_url"].as_str().unwrap();
    assert_eq!(
        url,
        format!("/isos/{project}/archlinux-{project}-2024.01.01-x86_64.iso")
    );
    assert_eq!(status["artifact_sha256"].as_str().unwrap().len(), 64);
    assert!(status["finished_at"].is_string());

    let details = engine.ok("project.getDetails", json!({"project_id": project}));
    assert_eq!(details["distro_id"], "arch");
    assert_eq!(details["packages"], json!(["base", "linux"]));
    assert_eq!(details["build_status"], "completed");
    assert_eq!(details["latest_build_id"], build_id.as_str());
}

#[test]
fn failed_build_is_reported_through_status() {
    let engine = Engine::with_build_script(BUILD_FAILS);
    let project = engine.create_arch_project();
    let build_id = engine.ok("project.buildIso", json!({"project_id": project}))["build_id"]
        .as_str()
        .unwrap()
        .to_string();

    let status = engine.wait_for_terminal(&project, &build_id);
    assert_eq!(status["status"], "failed");
    assert!(status["error_message"].as_str().unwrap().contains("exited"));
    assert!(status.get("download_url").is_none());

    // The engine keeps serving after a background failure.
    assert!(engine.ok("engine.ping", json!({}))["version"].is_string());
}

#[test]
fn unknown_distro_creates_nothing() {
    let engine = Engine::with_build_script(BUILD_OK);
    engine.create_arch_project();
    let before = engine.dispatcher.projects().len();

    assert_eq!(
        engine.error_code("engine.createProject", json!({"distro_id": "debian"})),
        PLUGIN_NOT_FOUND
    );
    assert_eq!(engine.dispatcher.projects().len(), before);
}

#[test]
fn unknown_project_is_rejected_by_every_action() {
    let engine = Engine::with_build_script(BUILD_OK);
    let params = json!({
        "project_id": "project-404",
        "build_id": "build-1",
        "packages": ["base"],
        "bootloader": "grub",
        "hostname": "box",
    });
    for action in [
        "getDetails",
        "setPackages",
        "getPackages",
        "setBootloader",
        "getBootloader",
        "setHostname",
        "getHostname",
        "buildIso",
        "streamBuildOutput",
        "getBuildStatus",
        "cancelBuild",
    ] {
        assert_eq!(
            engine.error_code(&format!("project.{action}"), params.clone()),
            PROJECT_NOT_FOUND,
            "{action}"
        );
    }
}

#[test]
fn configuration_setters_validate_and_persist() {
    let engine = Engine::with_build_script(BUILD_OK);
    let project = engine.create_arch_project();

    let details = engine.ok("project.getDetails", json!({"project_id": project}));
    assert_eq!(details["bootloader"], "grub/syslinux");
    assert_eq!(details["hostname"], "");
    assert_eq!(details["build_status"], "none");
    assert_eq!(details["packages"], json!(["base", "linux", "xf86-video-vesa"]));

    engine.ok(
        "project.setBootloader",
        json!({"project_id": project, "bootloader": "systemd-boot"}),
    );
    engine.ok(
        "project.setHostname",
        json!({"project_id": project, "hostname": "forge-01"}),
    );
    assert_eq!(
        engine.ok("project.getBootloader", json!({"project_id": project})),
        json!({"bootloader": "systemd-boot"})
    );
    assert_eq!(
        engine.ok("project.getHostname", json!({"project_id": project})),
        json!({"hostname": "forge-01"})
    );

    assert_eq!(
        engine.error_code(
            "project.setHostname",
            json!({"project_id": project, "hostname": "not a hostname"})
        ),
        INVALID_PARAMS
    );
    assert_eq!(
        engine.error_code(
            "project.setPackages",
            json!({"project_id": project, "packages": ["two words"]})
        ),
        INVALID_PARAMS
    );
    assert_eq!(
        engine.error_code("project.setBootloader", json!({"project_id": project})),
        INVALID_PARAMS
    );
}

#[test]
fn create_project_applies_options() {
    let engine = Engine::with_build_script(BUILD_OK);
    let created = engine.ok(
        "engine.createProject",
        json!({"distro_id": "arch", "packages": ["base"], "hostname": "kiosk", "bootloader": "grub"}),
    );
    let project = created["project_id"].as_str().unwrap();

    let details = engine.ok("project.getDetails", json!({"project_id": project}));
    assert_eq!(details["packages"], json!(["base"]));
    assert_eq!(details["hostname"], "kiosk");
    assert_eq!(details["bootloader"], "grub");

    let before = engine.dispatcher.projects().len();
    assert_eq!(
        engine.error_code(
            "engine.createProject",
            json!({"distro_id": "arch", "bootloader": "lilo"})
        ),
        INVALID_PARAMS
    );
    assert_eq!(engine.dispatcher.projects().len(), before);
}

#[test]
fn streamed_log_ends_with_marker() {
    let engine = Engine::with_build_script(BUILD_OK);
    let project = engine.create_arch_project();
    let build_id = engine.ok("project.buildIso", json!({"project_id": project}))["build_id"]
        .as_str()
        .unwrap()
        .to_string();

    let ack = engine.ok(
        "project.streamBuildOutput",
        json!({"project_id": project, "build_id": build_id}),
    );
    assert_eq!(ack["build_id"], build_id.as_str());
    assert!(ack["message"].is_string());

    let notifications = engine.wait_for_stream_end(&build_id);
    let log_lines: Vec<&str> = notifications
        .iter()
        .filter_map(|n| n["log_line"].as_str())
        .collect();
    assert_eq!(log_lines, vec!["step 1", "step 2", "step 3"]);

    let end = notifications.last().unwrap();
    assert_eq!(end["stream_end"], true);
    assert_eq!(end["status"], "completed");
    assert_eq!(end["project_id"], project.as_str());
}

#[test]
fn streaming_unknown_build_is_an_error() {
    let engine = Engine::with_build_script(BUILD_OK);
    let project = engine.create_arch_project();
    assert_eq!(
        engine.error_code(
            "project.streamBuildOutput",
            json!({"project_id": project, "build_id": "build-99"})
        ),
        BUILD_NOT_FOUND
    );
    assert_eq!(
        engine.error_code("project.streamBuildOutput", json!({"project_id": project})),
        INVALID_PARAMS
    );
}

#[test]
fn concurrent_streams_never_tear_lines() {
    let engine = Engine::with_build_script(BUILD_OK);
    let first = engine.create_arch_project();
    let second = engine.create_arch_project();

    let mut builds = Vec::new();
    for project in [&first, &second] {
        let build_id = engine.ok("project.buildIso", json!({"project_id": project}))["build_id"]
            .as_str()
            .unwrap()
            .to_string();
        engine.ok(
            "project.streamBuildOutput",
            json!({"project_id": project, "build_id": build_id}),
        );
        builds.push(build_id);
    }

    // lines() parses every output line, so a torn line fails here.
    for build_id in &builds {
        let notifications = engine.wait_for_stream_end(build_id);
        let log_lines = notifications.iter().filter(|n| n["log_line"].is_string()).count();
        assert_eq!(log_lines, 3, "{build_id}");
    }
}

#[test]
fn overlapping_build_is_rejected_until_cancelled() {
    let engine = Engine::with_build_script(BUILD_HANGS);
    let project = engine.create_arch_project();

    let build_id = engine.ok("project.buildIso", json!({"project_id": project}))["build_id"]
        .as_str()
        .unwrap()
        .to_string();
    let response = engine.call("project.buildIso", json!({"project_id": project}));
    assert_eq!(response["error"]["code"], BUILD_IN_PROGRESS);
    assert_eq!(response["error"]["data"]["build_id"], build_id.as_str());

    engine.ok(
        "project.cancelBuild",
        json!({"project_id": project, "build_id": build_id}),
    );
    let status = engine.wait_for_terminal(&project, &build_id);
    assert_eq!(status["status"], "failed");
    assert_eq!(status["error_message"], "build cancelled");

    // Cancelling a terminal build changes nothing.
    let again = engine.ok(
        "project.cancelBuild",
        json!({"project_id": project, "build_id": build_id}),
    );
    assert_eq!(again["status"], "failed");

    let next = engine.ok("project.buildIso", json!({"project_id": project}));
    assert_ne!(next["build_id"], build_id.as_str());
    engine.ok(
        "project.cancelBuild",
        json!({"project_id": project, "build_id": next["build_id"]}),
    );
    engine.wait_for_terminal(&project, next["build_id"].as_str().unwrap());
}

#[test]
fn protocol_errors_keep_correlation_ids() {
    let engine = Engine::with_build_script(BUILD_OK);

    engine.dispatcher.serve_line("{\"jsonrpc\":").unwrap();
    engine
        .dispatcher
        .serve_line(r#"{"jsonrpc":"2.0","method":"engine.ping","params":[1],"id":"p"}"#)
        .unwrap();
    engine
        .dispatcher
        .serve_line(r#"{"jsonrpc":"2.0","method":"ping","id":"m"}"#)
        .unwrap();

    let lines = engine.lines();
    assert_eq!(lines[0]["error"]["code"], -32700);
    assert!(lines[0]["id"].is_null());
    assert_eq!(lines[1]["error"]["code"], -32602);
    assert_eq!(lines[1]["id"], "p");
    assert_eq!(lines[2]["error"]["code"], -32601);
    assert_eq!(
        lines[2]["error"]["message"],
        "Invalid method format. Expected 'namespace.method'"
    );
}
