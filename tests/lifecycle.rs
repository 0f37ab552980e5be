// End-to-end lifecycle runs against a scripted toolchain and an in-memory key service

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use shipyard::bundle::{BundleError, SecretBundle};
use shipyard::config::{ConfigManager, OrchestratorConfig};
use shipyard::execution::{CommandRunner, CommandSpec, ExecError, ExecuteResult};
use shipyard::framework::DjangoDescriptor;
use shipyard::network::PortAllocator;
use shipyard::security::{GateError, KeyManagementService, KmsError, KmsKey};
use shipyard::service::{DeployError, DeployParams, DeploymentState, LifecycleManager, Service};
use shipyard::stage::StageError;

const BUNDLE: &str = "DJANGO_SETTINGS_MODULE=blog.settings\nSECRET_KEY=s3cret\nDATABASE_NAME=blog\nDATABASE_USER=blog\nDATABASE_PASSWORD=pw\nADMIN_USERNAME=admin\nADMIN_EMAIL=admin@example.com\nADMIN_PASSWORD=hunter2";

const SETTINGS_PY: &str = "DEBUG = False\nALLOWED_HOSTS = ['localhost']\nSTATIC_URL = '/assets/'\n";

/// Key service that "encrypts" by reversing bytes
#[derive(Default)]
struct MemoryKms {
    keys: Mutex<Vec<KmsKey>>,
    refuse_decrypt: AtomicBool,
}

#[async_trait]
impl KeyManagementService for MemoryKms {
    async fn create_key(&self, owner_id: &str, name: &str) -> Result<String, KmsError> {
        let mut keys = self.keys.lock().unwrap();
        let id = format!("key-{}", keys.len() + 1);
        keys.push(KmsKey {
            id: id.clone(),
            name: name.to_string(),
            description: owner_id.to_string(),
            status: "ACTIVE".to_string(),
            primary_version: None,
        });
        Ok(id)
    }

    async fn list_keys(&self) -> Result<Vec<KmsKey>, KmsError> {
        Ok(self.keys.lock().unwrap().clone())
    }

    async fn encrypt(&self, _key_id: &str, plaintext_b64: &str) -> Result<String, KmsError> {
        reverse(plaintext_b64)
    }

    async fn decrypt(&self, _key_id: &str, ciphertext_b64: &str) -> Result<String, KmsError> {
        if self.refuse_decrypt.load(Ordering::SeqCst) {
            return Err(KmsError::Status {
                operation: "decrypt",
                status: 403,
                body: "permission denied".to_string(),
            });
        }
        reverse(ciphertext_b64)
    }
}

fn reverse(b64: &str) -> Result<String, KmsError> {
    let mut bytes = STANDARD
        .decode(b64)
        .map_err(|e| KmsError::InvalidResponse(e.to_string()))?;
    bytes.reverse();
    Ok(STANDARD.encode(bytes))
}

/// Plays git, bandit, docker and the proxy reload
#[derive(Default)]
struct ScriptedTools {
    calls: Mutex<Vec<String>>,
    scans: AtomicUsize,
    build_exit: AtomicI32,
    up_exit: AtomicI32,
    up_times_out: AtomicBool,
}

impl ScriptedTools {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn clone_repo(url: &str, root: &Path) {
        let write = |path: &str, contents: &str| {
            let full = root.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        };

        write("manage.py", "import os\n");
        write("blog/__init__.py", "");
        write("blog/settings.py", SETTINGS_PY);
        if !url.contains("no-manifest") {
            write("requirements.txt", "django==4.2\n");
        }
        if url.contains("insecure") {
            write("blog/views.py", "def run(q):\n    return eval(q)\n");
        }
    }
}

fn exit(code: i32, stdout: &str) -> ExecuteResult {
    ExecuteResult {
        exit_code: code,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration_ms: 1,
    }
}

#[async_trait]
impl CommandRunner for ScriptedTools {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecuteResult, ExecError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", spec.program, spec.args.join(" ")));

        let result = match spec.program.as_str() {
            "git" => {
                let url = &spec.args[2];
                Self::clone_repo(url, Path::new(&spec.args[3]));
                exit(0, "")
            }
            "bandit" => {
                self.scans.fetch_add(1, Ordering::SeqCst);
                let source = std::fs::read_to_string(&spec.args[1]).unwrap_or_default();
                if source.contains("eval(") {
                    exit(1, ">> Issue: [B307:blacklist] Use of possibly insecure function")
                } else {
                    exit(0, "No issues identified.")
                }
            }
            "docker" => match spec.args[1].as_str() {
                "build" => exit(self.build_exit.load(Ordering::SeqCst), ""),
                "up" if self.up_times_out.load(Ordering::SeqCst) => {
                    return Err(ExecError::Timeout {
                        program: spec.program.clone(),
                        seconds: 600,
                    })
                }
                "up" => exit(self.up_exit.load(Ordering::SeqCst), ""),
                _ => exit(0, ""),
            },
            _ => exit(0, ""),
        };
        Ok(result)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    config: OrchestratorConfig,
    tools: Arc<ScriptedTools>,
    kms: Arc<MemoryKms>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ConfigManager::default_config();
        config.paths.secrets_dir = dir.path().join("secrets");
        config.paths.projects_dir = dir.path().join("projects");
        config.paths.templates_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates");
        config.paths.proxy_site_config = dir.path().join("nginx").join("default");
        std::fs::create_dir_all(dir.path().join("nginx")).unwrap();

        Self {
            _dir: dir,
            config,
            tools: Arc::new(ScriptedTools::default()),
            kms: Arc::new(MemoryKms::default()),
        }
    }

    fn manager(&self) -> LifecycleManager {
        LifecycleManager::new(
            &self.config,
            self.kms.clone(),
            self.tools.clone(),
            Arc::new(DjangoDescriptor::new()),
        )
        .with_port_allocator(PortAllocator::with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }

    fn staged_root(&self, dir_name: &str) -> PathBuf {
        self.config.paths.projects_dir.join(dir_name)
    }

    fn record(&self, user: &str, project: &str) -> PathBuf {
        self.config.paths.secrets_dir.join(user).join(project)
    }

    fn site_config(&self) -> String {
        std::fs::read_to_string(&self.config.paths.proxy_site_config).unwrap_or_default()
    }
}

fn params(repo: &str) -> DeployParams {
    DeployParams::new(SecretBundle::new(BUNDLE, "txt"), "7", "blog", repo)
}

#[test_log::test(tokio::test)]
async fn start_runs_the_whole_pipeline() {
    let harness = Harness::new();
    let mut manager = harness.manager();

    let started = manager.start(params("https://github.com/acme/blog.git")).await.unwrap();
    assert!(started);
    assert_eq!(manager.state(), DeploymentState::Running);

    let root = harness.staged_root("blog_7");
    let handle = manager.active().unwrap();
    assert_eq!(handle.host, "blog.ewdbot.com");
    assert_eq!(handle.project.root, root);
    assert_eq!(handle.status().compose_file, root.join("docker-compose.yml"));

    let dockerfile = std::fs::read_to_string(root.join("Dockerfile")).unwrap();
    assert!(dockerfile.contains("WORKDIR /blog_7"));
    let init_sql = std::fs::read_to_string(root.join("init.sql")).unwrap();
    assert!(init_sql.contains("IDENTIFIED BY 'pw'"));
    let nginx_conf = std::fs::read_to_string(root.join("config").join("nginx.conf")).unwrap();
    assert!(nginx_conf.contains("location /assets/ {"));

    let compose = std::fs::read_to_string(root.join("docker-compose.yml")).unwrap();
    assert!(compose.contains("SECRET_KEY=${SECRET_KEY}"));
    assert!(compose.contains(".:/blog_7"));

    let settings_py = std::fs::read_to_string(root.join("blog").join("settings.py")).unwrap();
    assert!(settings_py.contains(r#"ALLOWED_HOSTS = ["blog.ewdbot.com"]"#));
    assert!(settings_py.contains(r#"CSRF_TRUSTED_ORIGINS = ["https://blog.ewdbot.com"]"#));

    let site = harness.site_config();
    assert!(site.contains("server_name blog.ewdbot.com;"));
    assert!(site.contains(&format!("proxy_pass http://127.0.0.1:{};", handle.ports.proxy)));

    assert!(harness.record("7", "blog").is_file());
    assert_eq!(harness.kms.keys.lock().unwrap().len(), 1);

    let calls = harness.tools.calls();
    let order: Vec<&str> = calls
        .iter()
        .map(|c| c.split(' ').next().unwrap())
        .filter(|p| *p != "bandit")
        .collect();
    assert_eq!(order, ["git", "docker", "docker", "sudo"]);
    assert!(calls[calls.len() - 1].starts_with("sudo service nginx restart"));
}

#[tokio::test]
async fn stop_tears_everything_down() {
    let harness = Harness::new();
    let mut manager = harness.manager();
    assert!(manager.start(params("https://github.com/acme/blog.git")).await.unwrap());

    manager.stop().await.unwrap();

    assert!(manager.active().is_none());
    assert_eq!(manager.state(), DeploymentState::Stopped);
    assert!(!harness.staged_root("blog_7").exists());
    assert!(!harness.record("7", "blog").exists());
    assert_eq!(harness.tools.count("docker compose down"), 2);
    assert_eq!(harness.tools.count("docker compose down --rmi local"), 1);

    // Idle stop is a no-op
    manager.stop().await.unwrap();
    assert_eq!(harness.tools.count("docker compose down"), 2);
}

#[tokio::test]
async fn start_stop_start_matches_a_single_start() {
    let harness = Harness::new();
    let mut manager = harness.manager();

    assert!(manager.start(params("https://github.com/acme/blog.git")).await.unwrap());
    manager.stop().await.unwrap();
    assert!(manager.start(params("https://github.com/acme/blog.git")).await.unwrap());

    assert_eq!(manager.state(), DeploymentState::Running);
    assert!(harness.staged_root("blog_7").join("docker-compose.yml").is_file());
    assert!(harness.record("7", "blog").is_file());
    // The user's key is reused
    assert_eq!(harness.kms.keys.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn second_start_stops_the_live_deployment() {
    let harness = Harness::new();
    let mut manager = harness.manager();

    assert!(manager.start(params("https://github.com/acme/blog.git")).await.unwrap());
    let first = manager.active().unwrap().id;

    let other = DeployParams::new(SecretBundle::new(BUNDLE, "txt"), "7", "shop", "https://github.com/acme/shop.git");
    assert!(manager.start(other).await.unwrap());

    let handle = manager.active().unwrap();
    assert_ne!(handle.id, first);
    assert_eq!(handle.project_name, "shop");
    assert!(!harness.staged_root("blog_7").exists());
    assert!(harness.staged_root("shop_7").exists());
    assert_eq!(harness.tools.count("docker compose down --rmi local"), 1);
}

#[tokio::test]
async fn missing_manifest_fails_before_scanning() {
    let harness = Harness::new();
    let mut manager = harness.manager();

    let err = manager
        .start(params("https://github.com/acme/no-manifest.git"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Stage(StageError::MissingManifest(_))));
    assert_eq!(harness.tools.scans.load(Ordering::SeqCst), 0);
    assert_eq!(harness.tools.count("docker"), 0);
    assert!(!harness.staged_root("no-manifest_7").exists());
    assert_eq!(manager.state(), DeploymentState::Absent);
}

#[tokio::test]
async fn insecure_code_destroys_the_staged_tree() {
    let harness = Harness::new();
    let mut manager = harness.manager();

    let err = manager
        .start(params("https://github.com/acme/insecure.git"))
        .await
        .unwrap_err();

    assert!(err.is_security_issue());
    match err {
        DeployError::Gate(GateError::SecurityIssue { file, findings }) => {
            assert_eq!(file, "blog/views.py");
            assert!(findings.contains("B307"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!harness.staged_root("insecure_7").exists());
    assert_eq!(harness.tools.count("docker"), 0);
    assert!(harness.site_config().is_empty());
}

#[tokio::test]
async fn failed_build_reports_false_and_cleans_up() {
    let harness = Harness::new();
    harness.tools.build_exit.store(1, Ordering::SeqCst);
    let mut manager = harness.manager();

    let started = manager.start(params("https://github.com/acme/blog.git")).await.unwrap();

    assert!(!started);
    assert!(manager.active().is_none());
    assert!(!harness.staged_root("blog_7").exists());
    assert!(!harness.record("7", "blog").exists());
    assert_eq!(harness.tools.count("docker compose up"), 0);
    assert_eq!(harness.tools.count("docker compose down --rmi local"), 1);
}

#[tokio::test]
async fn failed_bring_up_reports_false_and_stops_services() {
    let harness = Harness::new();
    harness.tools.up_exit.store(1, Ordering::SeqCst);
    let mut manager = harness.manager();

    let started = manager.start(params("https://github.com/acme/blog.git")).await.unwrap();

    assert!(!started);
    assert_eq!(harness.tools.count("docker compose down"), 2);
    assert_eq!(harness.tools.count("docker compose down --rmi local"), 1);
    assert_eq!(harness.tools.count("sudo"), 0);
    assert!(!harness.staged_root("blog_7").exists());
    assert!(!harness.record("7", "blog").exists());
}

#[tokio::test]
async fn bring_up_timeout_tears_down_before_discarding_the_tree() {
    let harness = Harness::new();
    harness.tools.up_times_out.store(true, Ordering::SeqCst);
    let mut manager = harness.manager();

    let err = manager
        .start(params("https://github.com/acme/blog.git"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ToolTimeout(ExecError::Timeout { .. })));
    let docker: Vec<String> = harness
        .tools
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("docker"))
        .map(|c| c.split(" --build-arg").next().unwrap().to_string())
        .collect();
    assert_eq!(
        docker,
        [
            "docker compose build",
            "docker compose up -d",
            "docker compose down",
            "docker compose down --rmi local",
        ]
    );
    assert_eq!(harness.tools.count("sudo"), 0);
    assert!(!harness.staged_root("blog_7").exists());
    assert!(!harness.record("7", "blog").exists());
    assert!(manager.active().is_none());
    assert_eq!(manager.state(), DeploymentState::Absent);
}

#[tokio::test]
async fn failed_decrypt_forgets_the_new_record() {
    let harness = Harness::new();
    harness.kms.refuse_decrypt.store(true, Ordering::SeqCst);
    let mut manager = harness.manager();

    let err = manager
        .start(params("https://github.com/acme/blog.git"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Vault(_)));
    assert!(!harness.record("7", "blog").exists());
    assert!(harness.tools.calls().is_empty());
}

#[tokio::test]
async fn incomplete_bundles_fail_before_any_side_effect() {
    let harness = Harness::new();
    let mut manager = harness.manager();
    let bundle = BUNDLE.replace("\nADMIN_PASSWORD=hunter2", "");

    let err = manager
        .start(DeployParams::new(SecretBundle::new(bundle, "txt"), "7", "blog", "https://github.com/acme/blog.git"))
        .await
        .unwrap_err();

    match err {
        DeployError::Bundle(BundleError::MissingVariables { missing }) => {
            assert_eq!(missing, vec![("ADMIN".to_string(), "ADMIN_PASSWORD".to_string())]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(harness.tools.calls().is_empty());
    assert!(harness.kms.keys.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stop_project_only_matches_the_live_deployment() {
    let harness = Harness::new();
    let mut manager = harness.manager();
    assert!(manager.start(params("https://github.com/acme/blog.git")).await.unwrap());

    assert!(!manager.stop_project("8", "blog").await.unwrap());
    assert!(manager.active().is_some());

    assert!(manager.stop_project("7", "blog").await.unwrap());
    assert!(manager.active().is_none());
}

#[tokio::test]
async fn service_serialises_requests_through_one_slot() {
    let harness = Harness::new();
    let service = Service::spawn(harness.manager());

    assert!(service.start(params("https://github.com/acme/blog.git")).await.unwrap());
    let (state, status) = service.status().await.unwrap();
    assert_eq!(state, DeploymentState::Running);
    assert_eq!(status.unwrap().dir_name, "blog_7");

    assert!(service.restart(params("https://github.com/acme/blog.git")).await.unwrap());
    assert_eq!(harness.tools.count("git clone"), 2);

    assert_eq!(service.ensure_key("7").await.unwrap(), "key-1");

    service.stop().await.unwrap();
    let (state, status) = service.status().await.unwrap();
    assert_eq!(state, DeploymentState::Stopped);
    assert!(status.is_none());

    service.shutdown().await.unwrap();
    assert!(service.status().await.is_err());
}
