#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hoard::config::{StoreConfig, SyncSettings};
use hoard::core::fields::{FieldKind, FieldSpec};
use hoard::core::hash::{Fingerprint, Hasher};
use hoard::database::models::NewItem;
use hoard::database::now;
use hoard::services::{
    FixedPolicy, LocalMirror, MirrorStats, Resolution, SyncEngine, SyncOptions, SyncReport,
    Transfer, TransferError,
};
use hoard::{Item, Store};

pub fn create_test_image(path: &Path, seed: u32) {
    use image::{ImageBuffer, Rgb};

    let img = ImageBuffer::from_fn(64, 48, |x, y| {
        let intensity = ((x * seed + y * 3) % 256) as u8;
        Rgb([intensity, intensity / 2, 255 - intensity])
    });
    img.save(path).unwrap();
}

pub fn rating_config(remote: Option<&Path>, sync_config: bool) -> StoreConfig {
    StoreConfig {
        fields: vec![FieldSpec::new("rating", FieldKind::Int).with_aliases(["r"])],
        sync: remote.map(|remote| SyncSettings {
            remote: remote.to_path_buf(),
            sync_config,
        }),
        ..Default::default()
    }
}

/// Stage a synthetic image and return its path and fingerprint.
pub fn stage_image(store: &Store, name: &str, seed: u32) -> (PathBuf, Fingerprint) {
    let path = store.layout().staging().join(name);
    create_test_image(&path, seed);
    let fingerprint = Hasher::new().fingerprint(&path).unwrap();
    (path, fingerprint)
}

/// Insert a row with the given fingerprint and write a placeholder content
/// file for it.
pub fn add_item(store: &mut Store, fingerprint: Fingerprint) -> Item {
    let item = store
        .items()
        .unwrap()
        .insert(&NewItem::new("jpg", fingerprint), now())
        .unwrap();
    fs::write(store.item_path(&item), format!("item {}", item.id)).unwrap();
    item
}

/// Local mirror whose transfers to destinations matching `fails` break,
/// either before anything is copied or after the copy went through.
pub struct FailingMirror<F> {
    pub fails: F,
    pub after_copy: bool,
}

impl<F: Fn(&Path) -> bool> Transfer for FailingMirror<F> {
    fn mirror(
        &self,
        source: &Path,
        dest: &Path,
        delete_extraneous: bool,
    ) -> Result<MirrorStats, TransferError> {
        if (self.fails)(dest) {
            if self.after_copy {
                LocalMirror.mirror(source, dest, delete_extraneous)?;
            }
            return Err(TransferError::Io {
                action: "copy",
                path: dest.to_path_buf(),
                source: io::Error::other("link down"),
            });
        }
        LocalMirror.mirror(source, dest, delete_extraneous)
    }
}

pub fn sync(store: &mut Store) -> SyncReport {
    SyncEngine::new(LocalMirror)
        .sync(
            store,
            SyncOptions::default(),
            &mut FixedPolicy(Resolution::Skip),
            &mut (),
            &mut (),
        )
        .unwrap()
}

pub fn content_names(store: &Store) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(store.layout().contents())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
