use klarfunk_proto::config::{Config, Sequencing};
use klarfunk_proto::model::{ChannelId, CHANNEL_COUNT};
use std::path::PathBuf;

fn workspace_root() -> PathBuf {
    let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    crate_dir
        .parent()
        .and_then(|p| p.parent())
        .unwrap_or(crate_dir.as_path())
        .to_path_buf()
}

#[test]
fn example_config_loads() {
    let path = workspace_root().join("config.example.toml");
    let config = Config::load(&path).expect("example config must be valid");

    let channels = config.channel_list();
    assert_eq!(channels.len(), usize::from(CHANNEL_COUNT));
    assert!(channels.iter().all(|c| c.stream_url.starts_with("https://")));
    assert_eq!(
        channels[4].announcement,
        workspace_root().join("audio").join("channel_5.mp3")
    );
    assert_eq!(config.announcements.sequencing, Sequencing::Before);
    assert_eq!(config.input.shutdown_channel(), ChannelId::new(1));
}

#[test]
fn example_config_clip_names_are_distinct() {
    let config = Config::load(&workspace_root().join("config.example.toml")).unwrap();
    let clips = config.clips();
    let mut paths: Vec<_> = clips.entries().iter().map(|(_, p)| p.to_path_buf()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), clips.entries().len());
}
