//! Registered speaker modules, language packs and the mapping between them.
//!
//! Descriptors come from `*.json` files in a pack directory or are
//! registered directly. The mapping `module name -> (language module id ->
//! language pack name)` is rebuilt on every change; a reference without a
//! matching pack simply leaves that language unsupported.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::module::{LanguagePackDescriptor, SpeakerModuleDescriptor};
use crate::error::{EngineError, Result};

/// Kinds of descriptor found in a pack directory.
#[derive(Debug)]
enum Descriptor {
    Speaker(Box<SpeakerModuleDescriptor>),
    LanguagePack(Box<LanguagePackDescriptor>),
}

/// Catalog of every descriptor the engine knows about.
#[derive(Debug, Default)]
pub struct ModuleCatalog {
    dir: Option<PathBuf>,
    scanned_at: Option<SystemTime>, // Directory mtime at the last scan
    registered_speakers: BTreeMap<String, SpeakerModuleDescriptor>,
    registered_packs: BTreeMap<String, LanguagePackDescriptor>,
    // Registered descriptors overlaid with the last scan
    speakers: BTreeMap<String, SpeakerModuleDescriptor>,
    packs: BTreeMap<String, LanguagePackDescriptor>,
    mapping: BTreeMap<String, BTreeMap<String, String>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog over `dir` and scan it.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be listed. Bad files are skipped.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut catalog = Self { dir: Some(dir.into()), ..Default::default() };
        catalog.rescan()?;
        Ok(catalog)
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Re-read every descriptor in the pack directory and rebuild the mapping.
    ///
    /// Descriptors whose file is gone are dropped. Directly registered
    /// descriptors are kept unless a file replaces them.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be listed.
    pub fn rescan(&mut self) -> Result<()> {
        let Some(dir) = self.dir.clone() else {
            self.rebuild_mapping();
            return Ok(());
        };

        let mut speakers = self.registered_speakers.clone();
        let mut packs = self.registered_packs.clone();

        let mut found = 0usize;
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")))
            .collect();
        entries.sort();

        for path in entries {
            match read_descriptor(&path) {
                Ok(Some(Descriptor::Speaker(module))) => {
                    debug!("Found speaker module '{}' in {}", module.name, path.display());
                    speakers.insert(module.name.clone(), *module);
                    found += 1;
                }
                Ok(Some(Descriptor::LanguagePack(pack))) => {
                    debug!("Found language pack '{}' in {}", pack.pack_name(), path.display());
                    packs.insert(pack.pack_name().to_string(), *pack);
                    found += 1;
                }
                Ok(None) => debug!("Ignoring {}: not a module descriptor", path.display()),
                Err(e) => warn!("Skipping malformed descriptor: {}", e),
            }
        }

        let dropped = self.speakers.keys().filter(|name| !speakers.contains_key(*name)).count() + self.packs.keys().filter(|name| !packs.contains_key(*name)).count();
        if dropped > 0 {
            debug!("Dropped {} descriptors no longer in {}", dropped, dir.display());
        }

        self.speakers = speakers;
        self.packs = packs;
        self.scanned_at = dir_modified(&dir);
        self.rebuild_mapping();
        info!("📦 Scanned {}: {} descriptors, {} speaker modules, {} language packs", dir.display(), found, self.speakers.len(), self.packs.len());
        Ok(())
    }

    /// Rescan only if the pack directory changed since the last scan.
    ///
    /// # Returns
    /// `true` if a rescan happened.
    pub fn refresh(&mut self) -> Result<bool> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(false);
        };
        let modified = dir_modified(dir);
        if modified.is_some() && modified == self.scanned_at {
            return Ok(false);
        }
        self.rescan()?;
        Ok(true)
    }

    /// Register a speaker module without a file.
    pub fn register_speaker(&mut self, module: SpeakerModuleDescriptor) {
        self.registered_speakers.insert(module.name.clone(), module.clone());
        self.speakers.insert(module.name.clone(), module);
        self.rebuild_mapping();
    }

    /// Register a language pack without a file.
    pub fn register_pack(&mut self, pack: LanguagePackDescriptor) {
        self.registered_packs.insert(pack.pack_name().to_string(), pack.clone());
        self.packs.insert(pack.pack_name().to_string(), pack);
        self.rebuild_mapping();
    }

    fn rebuild_mapping(&mut self) {
        let mut mapping = BTreeMap::new();
        for (name, module) in &self.speakers {
            let mut entries = BTreeMap::new();
            for reference in module.phonemizer_modules.values() {
                match self.packs.values().find(|p| p.module_id == reference.module_id) {
                    Some(pack) => {
                        entries.insert(reference.module_id.clone(), pack.pack_name().to_string());
                    }
                    None => debug!("No language pack for '{}' referenced by '{}'", reference.module_id, name),
                }
            }
            mapping.insert(name.clone(), entries);
        }
        self.mapping = mapping;
    }

    pub fn speaker(&self, name: &str) -> Option<&SpeakerModuleDescriptor> {
        self.speakers.get(name)
    }

    pub fn speakers(&self) -> impl Iterator<Item = &SpeakerModuleDescriptor> {
        self.speakers.values()
    }

    pub fn pack(&self, name: &str) -> Option<&LanguagePackDescriptor> {
        self.packs.get(name)
    }

    /// Language pack name serving `language_module_id` for `module`.
    pub fn pack_name_for(&self, module: &str, language_module_id: &str) -> Option<&str> {
        self.mapping.get(module)?.get(language_module_id).map(String::as_str)
    }

    /// Language pack serving `language_module_id` for `module`.
    pub fn pack_for(&self, module: &str, language_module_id: &str) -> Option<&LanguagePackDescriptor> {
        self.pack_name_for(module, language_module_id).and_then(|name| self.packs.get(name))
    }

    /// Speaker modules that include the actor.
    pub fn modules_with_actor(&self, username: &str) -> Vec<&SpeakerModuleDescriptor> {
        self.speakers.values().filter(|m| m.actor(username).is_some()).collect()
    }

    /// Print every speaker module and its language packs.
    pub fn print_modules(&self) {
        println!("═══════════════════════════════════════════════════════════════════");
        println!("  Speaker modules");
        println!("═══════════════════════════════════════════════════════════════════");
        if self.speakers.is_empty() {
            println!("  (none)");
        }
        for module in self.speakers.values() {
            let actors: Vec<&str> = module.actors.iter().map(|a| a.username.as_str()).collect();
            let languages: Vec<String> = module.languages.iter().map(|l| l.to_string()).collect();
            println!("  {:<24} actors: {:<20} languages: {}", module.name, actors.join(", "), languages.join(", "));
            for reference in module.phonemizer_modules.values() {
                match self.pack_name_for(&module.name, &reference.module_id) {
                    Some(pack) => println!("      ↳ {} → {}", reference.module_id, pack),
                    None => println!("      ↳ {} → (missing)", reference.module_id),
                }
            }
        }
        println!("═══════════════════════════════════════════════════════════════════");
    }
}

fn dir_modified(dir: &Path) -> Option<SystemTime> {
    std::fs::metadata(dir).and_then(|m| m.modified()).ok()
}

/// Parse a descriptor, telling the two kinds apart by their fields.
fn read_descriptor(path: &Path) -> Result<Option<Descriptor>> {
    let bad = |e: &dyn std::fmt::Display| EngineError::Descriptor { path: path.to_path_buf(), message: e.to_string() };
    let data = std::fs::read_to_string(path).map_err(|e| bad(&e))?;
    let value: serde_json::Value = serde_json::from_str(&data).map_err(|e| bad(&e))?;

    if value.get("phonemizer_modules").is_some() {
        let module: SpeakerModuleDescriptor = serde_json::from_value(value).map_err(|e| bad(&e))?;
        return Ok(Some(Descriptor::Speaker(Box::new(module))));
    }
    if value.get("module_id").is_some() && value.get("vocabularies").is_some() {
        let pack: LanguagePackDescriptor = serde_json::from_value(value).map_err(|e| bad(&e))?;
        return Ok(Some(Descriptor::LanguagePack(Box::new(pack))));
    }
    Ok(None)
}
