//! Hot reload of user block manifests and templates

mod common;

use datagenflow::file_watcher::ExtensionFileWatcher;
use datagenflow::{BlockRegistry, BlockSource, Settings, TemplateRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn dropped_manifest_appears_after_the_debounce_window() {
    let blocks_dir = tempfile::tempdir().unwrap();
    let templates_dir = tempfile::tempdir().unwrap();
    let builtin_templates = tempfile::tempdir().unwrap();

    let settings = Settings {
        blocks_path: blocks_dir.path().to_path_buf(),
        custom_blocks_path: blocks_dir.path().join("does-not-exist"),
        builtin_templates_path: builtin_templates.path().to_path_buf(),
        templates_path: templates_dir.path().to_path_buf(),
        hot_reload: true,
        hot_reload_debounce_ms: 100,
        ..Settings::default()
    };

    let block_registry = Arc::new(BlockRegistry::with_roots(
        None,
        Some(blocks_dir.path().to_path_buf()),
    ));
    let template_registry = Arc::new(TemplateRegistry::new(
        builtin_templates.path().to_path_buf(),
        Some(templates_dir.path().to_path_buf()),
    ));

    let mut watcher = ExtensionFileWatcher::new(
        block_registry.clone(),
        template_registry.clone(),
        &settings,
    );
    assert!(watcher.start().unwrap());
    assert!(watcher.is_running());

    // drop a new user block manifest into the watched directory
    std::fs::write(
        blocks_dir.path().join("pirate.yaml"),
        "type: PirateValidator\nbase: Validator\nname: Pirate Validator\nconfig:\n  forbidden_words: '[\"landlubber\"]'\n",
    )
    .unwrap();

    let appeared = wait_until(Duration::from_secs(5), || {
        block_registry.list_blocks().iter().any(|info| {
            info.spec.type_name == "PirateValidator"
                && info.source == BlockSource::User
                && info.available
        })
    });
    assert!(appeared, "new user block should be discovered after reload");

    // a dropped template reloads the template registry
    std::fs::write(
        templates_dir.path().join("my_template.yaml"),
        "name: Mine\ndescription: user template\nblocks: []\n",
    )
    .unwrap();
    let appeared = wait_until(Duration::from_secs(5), || {
        template_registry.get_template("my_template").is_some()
    });
    assert!(appeared, "new user template should be discovered after reload");

    // deleting the manifest removes the block on the next reload
    std::fs::remove_file(blocks_dir.path().join("pirate.yaml")).unwrap();
    let removed = wait_until(Duration::from_secs(5), || {
        !block_registry
            .list_blocks()
            .iter()
            .any(|info| info.spec.type_name == "PirateValidator")
    });
    assert!(removed, "deleted manifests disappear on reload");

    watcher.stop();
    assert!(!watcher.is_running());
}

#[test]
fn disabled_hot_reload_never_starts() {
    let blocks_dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        blocks_path: blocks_dir.path().to_path_buf(),
        hot_reload: false,
        ..Settings::default()
    };

    let block_registry = Arc::new(BlockRegistry::new());
    let template_registry = Arc::new(TemplateRegistry::new(
        blocks_dir.path().join("none"),
        None,
    ));

    let mut watcher =
        ExtensionFileWatcher::new(block_registry, template_registry, &settings);
    assert!(!watcher.start().unwrap());
    assert!(!watcher.is_running());
}
