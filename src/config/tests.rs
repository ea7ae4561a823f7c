use super::*;

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.origin.host.as_str(), "http://localhost:3001/");
    assert_eq!(settings.cache.ttl, Duration::from_secs(DEFAULT_CACHE_TTL_SECS));
    assert_eq!(settings.cache.backend, StoreBackend::Memory);
    assert_eq!(settings.scheduler.concurrency.get(), DEFAULT_SCHEDULER_CONCURRENCY);
    assert_eq!(settings.renderer.user_agent, DEFAULT_RENDERER_USER_AGENT);
    assert_eq!(settings.http.regenerate_param, "regenerate");
    assert!(settings.http.crawler_user_agents.is_empty());
    assert!(settings.routes.is_empty());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.cache.backend = Some("memory".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        backend: BackendOverrides {
            cache_backend: Some("file".to_string()),
            pool_workers: Some(3),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.backend, StoreBackend::File);
    assert_eq!(settings.pool.workers.get(), 3);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_values_are_rejected() {
    let mut raw = RawSettings::default();
    raw.scheduler.concurrency = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "scheduler.concurrency",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.cache.ttl_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn origin_must_be_an_http_url() {
    let mut raw = RawSettings::default();
    raw.origin.host = Some("mailto:ops@example.com".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "origin.host", .. }));
}

#[test]
fn unknown_store_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("mongo".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "cache.backend", .. }));
}

#[test]
fn routes_compile_in_declaration_order() {
    let mut raw = RawSettings::default();
    raw.routes = vec![
        RawRouteSettings {
            pattern: Some("/blog/*".to_string()),
            sample: Some("/blog/hello".to_string()),
            ..Default::default()
        },
        RawRouteSettings {
            any_of: Some(vec!["/".to_string(), "/index.html".to_string()]),
            ..Default::default()
        },
        RawRouteSettings {
            regex: Some(r"/docs/v\d+/.*".to_string()),
            ..Default::default()
        },
    ];

    let settings = Settings::from_raw(raw).expect("valid settings");
    let sources: Vec<&str> = settings.routes.iter().map(RoutePattern::source).collect();
    assert_eq!(sources, vec!["/blog/*", "/ | /index.html", r"/docs/v\d+/.*"]);
    assert_eq!(settings.routes[0].sample(), Some("/blog/hello"));
    assert!(settings.routes[2].is_match("/docs/v2/intro"));
}

#[test]
fn routes_need_exactly_one_matcher() {
    let mut raw = RawSettings::default();
    raw.routes = vec![RawRouteSettings {
        pattern: Some("/a".to_string()),
        regex: Some("/a".to_string()),
        ..Default::default()
    }];
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.routes = vec![RawRouteSettings::default()];
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn crawler_agents_are_normalised() {
    let mut raw = RawSettings::default();
    raw.http.crawler_user_agents = Some(vec![
        " Googlebot ".to_string(),
        String::new(),
        "BingBot".to_string(),
    ]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.http.crawler_user_agents, vec!["googlebot", "bingbot"]);
}

#[test]
fn settings_load_from_a_config_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("crawlsnap.toml");
    std::fs::write(
        &path,
        r#"
[origin]
host = "https://app.example.com"

[cache]
ttl_seconds = 30

[[routes]]
pattern = "/about"

[[routes]]
pattern = "/blog/*"
sample = "/blog/welcome"
"#,
    )
    .expect("write config");

    let cli = CliArgs::parse_from([
        "crawlsnap",
        "--config-file",
        path.to_str().expect("utf-8 path"),
        "crawl",
        "--origin-host",
        "https://staging.example.com",
    ]);
    let settings = load(&cli).expect("settings");

    assert_eq!(settings.origin.host.as_str(), "https://staging.example.com/");
    assert_eq!(settings.cache.ttl, Duration::from_secs(30));
    assert_eq!(settings.routes.len(), 2);
    assert_eq!(settings.routes[0].sample(), Some("/about"));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["crawlsnap"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_render_arguments() {
    let args = CliArgs::parse_from([
        "crawlsnap",
        "render",
        "--force",
        "--renderer-command",
        "/usr/local/bin/headless",
        "/blog/first",
    ]);

    match args.command.expect("render command") {
        Command::Render(render) => {
            assert!(render.force);
            assert_eq!(render.path, "/blog/first");
            assert_eq!(
                render.overrides.render.command.as_deref(),
                Some(std::path::Path::new("/usr/local/bin/headless"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "crawlsnap",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--cache-backend",
        "file",
        "--cache-directory",
        "/var/lib/crawlsnap",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.backend.cache_backend.as_deref(), Some("file"));
            assert_eq!(
                serve.overrides.backend.cache_directory.as_deref(),
                Some(std::path::Path::new("/var/lib/crawlsnap"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}
