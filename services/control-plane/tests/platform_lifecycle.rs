use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use vitrine_control_plane::{
    admin::{self, AdminCommand, KindSelector},
    config::Config,
    db::{StaticTenantSource, TenantSource},
    instance::InstanceStatus,
    orchestrator::{mock::MockOp, MockOrchestrator},
    provision::{InMemoryProvisioner, ProvisionStep},
    reconciler::Reconciler,
    routing::PLATFORM_FILE,
    tenant::TenantRecord,
};
use vitrine_namespace::{TenantId, TenantKind};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Platform {
    dir: TempDir,
    source: Arc<StaticTenantSource>,
    mock: Arc<MockOrchestrator>,
    provisioner: Arc<InMemoryProvisioner>,
    reconciler: Reconciler,
    // Keeps the per-tenant readiness endpoints alive.
    servers: Vec<MockServer>,
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.tenancy.volume_root = root.join("volumes");
    config.proxy.available_dir = root.join("available");
    config.proxy.enabled_dir = root.join("enabled");
    config.proxy.reload_cooldown = Duration::from_millis(20);
    config.probe.interval = Duration::from_millis(10);
    config.probe.max_attempts = 3;
    config.probe.request_timeout = Duration::from_secs(1);
    config.call_timeout = Duration::from_secs(2);
    config
}

fn platform(tenants: Vec<TenantRecord>) -> Platform {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let source = Arc::new(StaticTenantSource::new(tenants));
    let mock = Arc::new(MockOrchestrator::new());
    let provisioner = Arc::new(InMemoryProvisioner::new());

    let tenant_source: Arc<dyn TenantSource> = source.clone();
    let reconciler = Reconciler::assemble(&config, tenant_source, mock.clone(), provisioner.clone());

    Platform {
        dir,
        source,
        mock,
        provisioner,
        reconciler,
        servers: Vec::new(),
    }
}

impl Platform {
    /// Serve an environment document for `tenant`; `honest = false` echoes
    /// another tenant's identity.
    async fn serve_env(&mut self, tenant: &TenantRecord, honest: bool) {
        let ns = self.reconciler.resolver().resolve(&tenant.id);
        let tenant_id = if honest {
            tenant.id.to_string()
        } else {
            TenantId::new().to_string()
        };

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/__env"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "TENANT_ID": tenant_id,
                "TENANT_KIND": tenant.kind.as_str(),
                "DB_NAME": ns.db_name,
            })))
            .mount(&server)
            .await;

        self.mock
            .override_published_port(&ns.container_name, server.address().port());
        self.servers.push(server);
    }

    /// A second control plane over the same directories, orchestrator and
    /// tenant records, with nothing cached (one-shot admin invocations).
    fn fresh_reconciler(&self) -> Reconciler {
        let source: Arc<dyn TenantSource> = self.source.clone();
        Reconciler::assemble(
            &test_config(self.dir.path()),
            source,
            self.mock.clone(),
            self.provisioner.clone(),
        )
    }

    fn service(&self, tenant: &TenantRecord) -> String {
        self.reconciler.resolver().resolve(&tenant.id).container_name
    }

    async fn read_config(&self, name: &str) -> Option<String> {
        self.reconciler.routing().files().read(name).await.unwrap()
    }
}

fn store(name: &str) -> TenantRecord {
    TenantRecord::new(TenantKind::Store, TenantId::new(), name)
}

#[tokio::test]
async fn test_sync_launches_active_tenants_and_routes_them() {
    let shop = store("shop").with_domains(["Shop.Example.com", "shop.example.com"]);
    let idle = store("idle").with_active(false);
    let theme = TenantRecord::new(TenantKind::Theme, TenantId::new(), "dawn");
    let mut p = platform(vec![shop.clone(), idle.clone(), theme.clone()]);
    p.serve_env(&shop, true).await;
    p.serve_env(&theme, true).await;

    let outcome = p.reconciler.synchronize().await;
    assert!(outcome.is_ok(), "{outcome}");
    assert!(p.reconciler.flush().await.is_ok());

    // Services for active tenants only.
    assert_eq!(p.mock.replicas_of(&p.service(&shop)), Some(1));
    assert_eq!(p.mock.replicas_of(&p.service(&theme)), Some(1));
    assert!(p.mock.replicas_of(&p.service(&idle)).is_none());

    let spec = p.mock.spec_of(&p.service(&shop)).unwrap();
    assert_eq!(spec.env.get("TENANT_ID"), Some(&shop.id.to_string()));
    assert_eq!(spec.env.get("TENANT_KIND").map(String::as_str), Some("store"));
    assert_eq!(spec.mounts[0].target, "/data");

    let ns = p.reconciler.resolver().resolve(&shop.id);
    assert!(p.provisioner.has_user(&ns.user_name));
    assert!(p.provisioner.has_database(&ns.db_name));
    assert_eq!(
        p.reconciler.instances().status_of(&ns.container_name).await,
        Some(InstanceStatus::Healthy)
    );

    // Registry
    assert_eq!(p.reconciler.registry().tenant_id_by_name("shop").await, Some(shop.id));
    assert_eq!(p.reconciler.registry().backends(&shop.id).await.len(), 1);

    // Domain file for the store, path routing for the theme.
    let tenant_file = p
        .read_config(&format!("{}.conf", shop.base_id()))
        .await
        .unwrap();
    assert!(tenant_file.contains("server_name shop.example.com;"));
    let platform_file = p.read_config(PLATFORM_FILE).await.unwrap();
    assert!(platform_file.contains(&format!("location /{}/", theme.base_id())));
    assert!(!platform_file.contains(&format!("location /{}/", shop.base_id())));

    // One validated reload for the whole pass.
    assert_eq!(p.mock.exec_count("nginx -t"), 1);
    assert_eq!(p.mock.exec_count("reload"), 1);
}

#[tokio::test]
async fn test_repeated_sync_changes_nothing() {
    let shop = store("shop").with_domains(["shop.example.com"]);
    let mut p = platform(vec![shop.clone()]);
    p.serve_env(&shop, true).await;

    assert!(p.reconciler.synchronize().await.is_ok());
    assert!(p.reconciler.flush().await.is_ok());
    let before = p.read_config(PLATFORM_FILE).await;

    assert!(p.reconciler.synchronize().await.is_ok());
    assert!(p.reconciler.flush().await.is_ok());

    assert_eq!(p.read_config(PLATFORM_FILE).await, before);
    assert_eq!(p.mock.exec_count("reload"), 1);
    assert_eq!(p.provisioner.created(ProvisionStep::User), 1);
}

#[tokio::test]
async fn test_unready_tenant_fails_alone() {
    let good = store("good");
    let bad = store("bad");
    let mut p = platform(vec![good.clone(), bad.clone()]);
    p.serve_env(&good, true).await;
    p.serve_env(&bad, false).await;

    let outcome = p.reconciler.synchronize().await;
    assert!(!outcome.is_ok());
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].operation, "readiness");
    assert_eq!(outcome.errors[0].tenant_id, Some(bad.id.to_string()));

    let instances = p.reconciler.instances();
    assert_eq!(instances.status_of(&p.service(&good)).await, Some(InstanceStatus::Healthy));
    assert_eq!(instances.status_of(&p.service(&bad)).await, Some(InstanceStatus::Failed));
    // Left stopped so the next pass tries again.
    assert_eq!(p.mock.replicas_of(&p.service(&bad)), Some(0));
    assert!(p.reconciler.registry().backends(&bad.id).await.is_empty());
}

#[tokio::test]
async fn test_provisioning_failure_skips_launch() {
    let shop = store("shop");
    let mut p = platform(vec![shop.clone()]);
    p.serve_env(&shop, true).await;
    p.provisioner.fail_on(ProvisionStep::Database);

    let outcome = p.reconciler.synchronize().await;
    assert!(!outcome.is_ok());
    assert!(p.mock.replicas_of(&p.service(&shop)).is_none());

    p.provisioner.clear_failures();
    assert!(p.reconciler.synchronize().await.is_ok());
    assert_eq!(p.mock.replicas_of(&p.service(&shop)), Some(1));
}

#[tokio::test]
async fn test_store_follows_theme_backends() {
    let theme = TenantRecord::new(TenantKind::Theme, TenantId::new(), "dawn");
    let shop = store("shop").with_theme(theme.id);
    let mut p = platform(vec![shop.clone(), theme.clone()]);
    p.serve_env(&theme, true).await;
    p.serve_env(&shop, true).await;

    assert!(p.reconciler.synchronize().await.is_ok());

    let theme_port = p.servers[0].address().port();
    let backends = p.reconciler.registry().backends(&shop.id).await;
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0].port, theme_port);
}

#[tokio::test]
async fn test_admin_stop_scale_and_delete() {
    let shop = store("shop").with_domains(["shop.example.com"]);
    let mut p = platform(vec![shop.clone()]);
    p.serve_env(&shop, true).await;
    let service = p.service(&shop);

    let start = AdminCommand::Start {
        kind: TenantKind::Store,
        id: shop.id,
    };
    assert!(admin::execute(&p.reconciler, start).await.is_ok());
    assert_eq!(p.mock.replicas_of(&service), Some(1));

    let scale = AdminCommand::Scale {
        kind: TenantKind::Store,
        id: shop.id,
        replicas: 3,
    };
    assert!(admin::execute(&p.reconciler, scale).await.is_ok());
    assert_eq!(p.mock.replicas_of(&service), Some(3));

    let stop = AdminCommand::Stop {
        kind: TenantKind::Store,
        id: shop.id,
    };
    assert!(admin::execute(&p.reconciler, stop).await.is_ok());
    assert_eq!(p.mock.replicas_of(&service), Some(0));
    assert!(p.reconciler.registry().backends(&shop.id).await.is_empty());

    p.source.remove(TenantKind::Store, &shop.id).await;
    let outcome = admin::execute(&p.reconciler, AdminCommand::Delete { id: shop.id }).await;
    assert!(outcome.is_ok(), "{outcome}");

    let ns = p.reconciler.resolver().resolve(&shop.id);
    assert!(p.mock.replicas_of(&service).is_none());
    assert!(!p.provisioner.has_user(&ns.user_name));
    assert!(!p.provisioner.has_database(&ns.db_name));
    assert!(p.reconciler.registry().tenant(&shop.id).await.is_none());
    assert!(p
        .read_config(&format!("{}.conf", shop.base_id()))
        .await
        .is_none());
    assert!(!p
        .read_config(PLATFORM_FILE)
        .await
        .unwrap()
        .contains(&shop.base_id()));
}

#[tokio::test]
async fn test_start_unknown_tenant_fails() {
    let p = platform(vec![]);
    let outcome = admin::execute(
        &p.reconciler,
        AdminCommand::Start {
            kind: TenantKind::Theme,
            id: TenantId::new(),
        },
    )
    .await;

    assert!(!outcome.is_ok());
    assert_eq!(outcome.errors[0].operation, "load_tenant");
}

#[tokio::test]
async fn test_group_stop_only_touches_kind() {
    let shop = store("shop");
    let theme = TenantRecord::new(TenantKind::Theme, TenantId::new(), "dawn");
    let mut p = platform(vec![shop.clone(), theme.clone()]);
    p.serve_env(&shop, true).await;
    p.serve_env(&theme, true).await;
    assert!(p.reconciler.synchronize().await.is_ok());

    let command = AdminCommand::GroupStop(KindSelector(Some(TenantKind::Theme)));
    assert!(admin::execute(&p.reconciler, command).await.is_ok());

    assert_eq!(p.mock.replicas_of(&p.service(&theme)), Some(0));
    assert_eq!(p.mock.replicas_of(&p.service(&shop)), Some(1));
}

#[tokio::test]
async fn test_gc_removes_orphans_only() {
    let shop = store("shop");
    let mut p = platform(vec![shop.clone()]);
    p.serve_env(&shop, true).await;
    assert!(p.reconciler.synchronize().await.is_ok());

    let volumes = p.dir.path().join("volumes");
    let ns = p.reconciler.resolver().resolve(&shop.id);
    tokio::fs::create_dir_all(&ns.volume_source).await.unwrap();
    tokio::fs::create_dir_all(volumes.join("deadbeef")).await.unwrap();
    tokio::fs::create_dir_all(volumes.join("lost+found")).await.unwrap();
    let files = p.reconciler.routing().files();
    files.write("deadbeef.conf", "server {}\n").await.unwrap();

    let outcome = p.reconciler.garbage_collect().await;
    assert!(outcome.is_ok(), "{outcome}");

    assert!(ns.volume_source.exists());
    assert!(volumes.join("lost+found").exists());
    assert!(!volumes.join("deadbeef").exists());
    assert!(files.read("deadbeef.conf").await.unwrap().is_none());
    assert!(files.read(PLATFORM_FILE).await.unwrap().is_some());
    assert_eq!(p.mock.replicas_of(&p.service(&shop)), Some(1));
}

#[tokio::test]
async fn test_failed_validation_keeps_previous_config() {
    let shop = store("shop");
    let later = store("later");
    let mut p = platform(vec![shop.clone()]);
    p.serve_env(&shop, true).await;
    p.serve_env(&later, true).await;

    assert!(p.reconciler.synchronize().await.is_ok());
    assert!(p.reconciler.flush().await.is_ok());
    let good = p.read_config(PLATFORM_FILE).await.unwrap();

    p.mock.set_exec_exit_code("nginx -t", 1);
    p.source.upsert(later.clone()).await;
    assert!(p.reconciler.synchronize().await.is_ok());

    let outcome = p.reconciler.flush().await;
    assert!(!outcome.is_ok());
    assert_eq!(outcome.errors[0].operation, "proxy_reload");
    assert_eq!(p.read_config(PLATFORM_FILE).await.unwrap(), good);
    assert_eq!(p.mock.exec_count("reload"), 1);
}

#[tokio::test]
async fn test_orchestrator_outage_is_reported_per_tenant() {
    let shop = store("shop");
    let theme = TenantRecord::new(TenantKind::Theme, TenantId::new(), "dawn");
    let p = platform(vec![shop.clone(), theme.clone()]);
    p.mock.fail_on(MockOp::Inspect);

    let outcome = p.reconciler.synchronize().await;
    assert_eq!(outcome.error_count(), 2);
    assert!(outcome.errors.iter().all(|e| e.operation == "inspect"));
}

#[tokio::test]
async fn test_one_shot_command_keeps_other_routes() {
    let theme = TenantRecord::new(TenantKind::Theme, TenantId::new(), "dawn");
    let shop = store("shop");
    let other = store("other");
    let mut p = platform(vec![theme.clone(), shop.clone(), other.clone()]);
    for tenant in [&theme, &shop, &other] {
        p.serve_env(tenant, true).await;
    }
    assert!(p.reconciler.synchronize().await.is_ok());
    assert!(p.reconciler.flush().await.is_ok());

    let one_shot = p.fresh_reconciler();
    let restart = AdminCommand::Restart {
        kind: TenantKind::Store,
        id: shop.id,
    };
    let outcome = admin::execute(&one_shot, restart).await;
    assert!(outcome.is_ok(), "{outcome}");

    let platform_file = p.read_config(PLATFORM_FILE).await.unwrap();
    for tenant in [&theme, &shop, &other] {
        assert!(
            platform_file.contains(&format!("location /{}/", tenant.base_id())),
            "{} lost its route",
            tenant.name
        );
    }
    let theme_port = p.servers[0].address().port();
    assert!(platform_file.contains(&format!("127.0.0.1:{theme_port}")));
}

#[tokio::test]
async fn test_stopped_service_keeps_its_port() {
    // Neither tenant serves its environment, so both end up stopped.
    let first = store("first");
    let second = store("second");
    let p = platform(vec![first.clone(), second.clone()]);

    let outcome = p.reconciler.provision_and_run(&first).await;
    assert_eq!(outcome.errors[0].operation, "readiness");
    assert_eq!(p.mock.replicas_of(&p.service(&first)), Some(0));

    p.reconciler.provision_and_run(&second).await;
    let first_port = p.mock.spec_of(&p.service(&first)).unwrap().published_port;
    let second_port = p.mock.spec_of(&p.service(&second)).unwrap().published_port;
    assert_ne!(first_port, second_port);

    // Relaunching reuses the port the service already publishes.
    p.reconciler.provision_and_run(&first).await;
    assert_eq!(
        p.mock.spec_of(&p.service(&first)).unwrap().published_port,
        first_port
    );
}

#[tokio::test]
async fn test_restart_applies_changed_environment() {
    let shop = store("shop").with_env("FEATURE", "old");
    let mut p = platform(vec![shop.clone()]);
    p.serve_env(&shop, true).await;
    assert!(p.reconciler.provision_and_run(&shop).await.is_ok());

    let shop = shop.with_env("FEATURE", "new");
    p.source.upsert(shop.clone()).await;
    let restart = AdminCommand::Restart {
        kind: TenantKind::Store,
        id: shop.id,
    };
    assert!(admin::execute(&p.reconciler, restart).await.is_ok());

    let spec = p.mock.spec_of(&p.service(&shop)).unwrap();
    assert_eq!(spec.env.get("FEATURE").map(String::as_str), Some("new"));
    assert_eq!(p.mock.replicas_of(&p.service(&shop)), Some(1));
}

#[tokio::test]
async fn test_undecodable_row_fails_alone() {
    let shop = store("shop");
    let broken = TenantId::new();
    let mut p = platform(vec![shop.clone()]);
    p.serve_env(&shop, true).await;
    p.source.add_broken(TenantKind::Store, broken).await;

    let outcome = p.reconciler.synchronize().await;
    assert_eq!(outcome.error_count(), 1);
    assert_eq!(outcome.errors[0].operation, "load_tenant");
    assert_eq!(outcome.errors[0].tenant_id, Some(broken.to_string()));
    assert_eq!(p.mock.replicas_of(&p.service(&shop)), Some(1));

    // Its artifacts still count as owned.
    let volume = p.reconciler.resolver().resolve(&broken).volume_source;
    tokio::fs::create_dir_all(&volume).await.unwrap();
    assert!(p.reconciler.garbage_collect().await.is_ok());
    assert!(volume.exists());
}
