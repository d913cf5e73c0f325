//! Packaging wrappers: spawn vector rewriting.

use uuid::Uuid;

use arras_node::supervisor::{apply_packaging, PackagingSystem, SpawnArgs};

#[test]
fn tags_parse_to_the_right_system() {
    assert_eq!(PackagingSystem::from_tag("").unwrap(), PackagingSystem::None);
    assert_eq!(
        PackagingSystem::from_tag("none").unwrap(),
        PackagingSystem::None
    );
    assert_eq!(
        PackagingSystem::from_tag("current-environment").unwrap(),
        PackagingSystem::CurrentEnvironment
    );
    assert_eq!(
        PackagingSystem::from_tag("bash").unwrap(),
        PackagingSystem::Bash
    );
    assert_eq!(
        PackagingSystem::from_tag("rez1").unwrap(),
        PackagingSystem::Rez1
    );
    assert_eq!(
        PackagingSystem::from_tag("rez2").unwrap(),
        PackagingSystem::Rez2
    );
    assert!(PackagingSystem::from_tag("conda").is_err());
}

#[tokio::test]
async fn no_packaging_resolves_the_program_on_path() {
    let mut args = SpawnArgs {
        program: "sh".into(),
        ..SpawnArgs::default()
    };
    args.environment
        .insert("PATH".into(), "/nonexistent:/bin:/usr/bin".into());

    apply_packaging(
        &mut args,
        PackagingSystem::None,
        &serde_json::json!({}),
        Uuid::new_v4(),
        "",
    )
    .await
    .expect("sh must resolve");

    assert!(
        args.program.ends_with("/sh"),
        "program must be absolute: {}",
        args.program
    );
}

#[tokio::test]
async fn no_packaging_fails_for_a_missing_program() {
    let mut args = SpawnArgs {
        program: "definitely-not-a-real-binary".into(),
        ..SpawnArgs::default()
    };
    args.environment.insert("PATH".into(), "/bin".into());

    let err = apply_packaging(
        &mut args,
        PackagingSystem::None,
        &serde_json::json!({}),
        Uuid::new_v4(),
        "",
    )
    .await
    .expect_err("missing program must fail");
    assert!(err.to_string().contains("cannot find executable"));
}

#[tokio::test]
async fn bash_packaging_wraps_the_original_command() {
    let mut args = SpawnArgs {
        program: "execComp".into(),
        args: vec!["--cores".into(), "2".into()],
        ..SpawnArgs::default()
    };

    apply_packaging(
        &mut args,
        PackagingSystem::Bash,
        &serde_json::json!({ "script": "/studio/env.sh" }),
        Uuid::new_v4(),
        "",
    )
    .await
    .expect("bash wrap must succeed");

    assert_eq!(args.program, "/bin/bash");
    assert_eq!(args.args[0], "-c");
    let command = &args.args[1];
    assert!(command.contains("source '/studio/env.sh'"));
    assert!(command.contains("exec 'execComp' '--cores' '2'"));
}

#[tokio::test]
async fn bash_packaging_requires_a_script() {
    let mut args = SpawnArgs {
        program: "execComp".into(),
        ..SpawnArgs::default()
    };
    let err = apply_packaging(
        &mut args,
        PackagingSystem::Bash,
        &serde_json::json!({}),
        Uuid::new_v4(),
        "",
    )
    .await
    .expect_err("missing script must fail");
    assert!(err.to_string().contains("shell script"));
}

#[tokio::test]
async fn rez_packaging_requires_a_context_or_packages() {
    let mut args = SpawnArgs {
        program: "execComp".into(),
        ..SpawnArgs::default()
    };
    let err = apply_packaging(
        &mut args,
        PackagingSystem::Rez1,
        &serde_json::json!({}),
        Uuid::new_v4(),
        "",
    )
    .await
    .expect_err("empty rez context must fail");
    assert!(err.to_string().contains("rez_context"));
}

#[tokio::test]
async fn rez_context_file_wraps_like_a_shell_source() {
    let mut args = SpawnArgs {
        program: "execComp".into(),
        ..SpawnArgs::default()
    };
    apply_packaging(
        &mut args,
        PackagingSystem::Rez2,
        &serde_json::json!({
            "rez_context_file": "/studio/context.sh",
            "rez_packages_prepend": "/studio/packages",
        }),
        Uuid::new_v4(),
        "",
    )
    .await
    .expect("context file wrap must succeed");

    assert_eq!(args.program, "/bin/bash");
    assert!(args.args[1].contains("source '/studio/context.sh'"));
    let rez_path = args.environment.get("REZ_PACKAGES_PATH").unwrap();
    assert!(rez_path.starts_with("/studio/packages"));
}

#[tokio::test]
async fn package_path_override_wins_over_the_definition() {
    let mut args = SpawnArgs {
        program: "execComp".into(),
        ..SpawnArgs::default()
    };
    apply_packaging(
        &mut args,
        PackagingSystem::Rez2,
        &serde_json::json!({
            "rez_context_file": "/studio/context.sh",
            "rez_packages_prepend": "/studio/packages",
        }),
        Uuid::new_v4(),
        "/override/packages",
    )
    .await
    .unwrap();

    assert_eq!(
        args.environment.get("REZ_PACKAGES_PATH").unwrap(),
        "/override/packages"
    );
}
