use audio_output_coordinator::config::{ConfigLoader, ConfigPreferenceStore};
use audio_output_coordinator::priority::PreferenceRecord;
use audio_output_coordinator::system::{MockFileSystem, PreferenceStore, StandardFileSystem};
use std::path::PathBuf;
use tempfile::TempDir;

/// Integration tests for ConfigLoader and the preference store on top of it

#[cfg(test)]
mod real_file_system {
    use super::*;

    fn loader_in(dir: &TempDir) -> ConfigLoader<StandardFileSystem> {
        ConfigLoader::new_production(dir.path().join("nested/config.toml"))
    }

    #[test]
    fn test_missing_config_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let loader = loader_in(&dir);

        let config = loader.load_config().unwrap();

        assert!(loader.config_exists());
        assert!(config.preferences.most_recent_wins);
        let written = std::fs::read_to_string(loader.get_config_path()).unwrap();
        assert!(written.contains("[preferences]"));
        assert!(written.contains("[virtual_device]"));
    }

    #[test]
    fn test_preference_survives_restart() {
        let dir = TempDir::new().unwrap();
        let record = PreferenceRecord {
            preferred_output_uid: Some("AppleUSBAudioEngine:Dock:1".to_string()),
            most_recent_wins: false,
        };

        ConfigPreferenceStore::new(loader_in(&dir))
            .save(&record)
            .unwrap();

        let reopened = ConfigPreferenceStore::new(loader_in(&dir));
        assert_eq!(reopened.load().unwrap(), record);
    }

    #[test]
    fn test_external_edit_is_seen_on_next_load() {
        let dir = TempDir::new().unwrap();
        let loader = loader_in(&dir);
        loader.load_config().unwrap();

        std::fs::write(
            loader.get_config_path(),
            "[preferences]\npreferred_output_uid = \"hdmi\"\n",
        )
        .unwrap();

        let store = ConfigPreferenceStore::new(loader);
        assert_eq!(
            store.load().unwrap().preferred_output_uid.as_deref(),
            Some("hdmi")
        );
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "preferences = [").unwrap();

        let store = ConfigPreferenceStore::new(ConfigLoader::new_production(path));
        assert!(store.load().is_err());
    }
}

#[cfg(test)]
mod mock_file_system {
    use super::*;

    #[test]
    fn test_save_failure_is_reported() {
        let file_system = MockFileSystem::new();
        file_system.set_write_failure(true);
        let store = ConfigPreferenceStore::new(ConfigLoader::new(
            file_system,
            PathBuf::from("/test/config.toml"),
        ));

        let record = PreferenceRecord {
            preferred_output_uid: Some("speakers".to_string()),
            most_recent_wins: true,
        };
        assert!(store.save(&record).is_err());
    }

    #[test]
    fn test_read_failure_is_reported() {
        let file_system = MockFileSystem::new();
        let config_path = PathBuf::from("/test/config.toml");
        file_system.add_file(&config_path, String::new());
        file_system.set_read_failure(true);

        let store = ConfigPreferenceStore::new(ConfigLoader::new(file_system, config_path));
        assert!(store.load().is_err());
    }

    #[test]
    fn test_directory_failure_still_yields_defaults() {
        let file_system = MockFileSystem::new();
        file_system.set_create_dir_failure(true);
        let loader = ConfigLoader::new(file_system.clone(), PathBuf::from("/test/config.toml"));

        let config = loader.load_config().unwrap();

        assert_eq!(config, Default::default());
        assert!(file_system.get_write_calls().is_empty());
    }
}
