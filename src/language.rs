use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::config::{ByteSize, LanguageConfig, MicroSecond, ProfileConfig};
use crate::error::JudgeError;

const DEFAULT_TIME_LIMIT: MicroSecond = MicroSecond(2_000_000);
const DEFAULT_MEMORY_LIMIT: ByteSize = ByteSize(256 << 20);
const EXECUTABLE_NAME: &str = "main";

/// Resource caps shared by every toolchain that names this profile
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    pub name: String,
    pub processes: u32,
    pub open_files: u32,
    /// Largest file the program may write, in bytes
    pub file_size: u64,
    pub limit_address_space: bool,
    pub wrapper: Vec<String>,
    pub env: Vec<String>,
    pub dirs: Vec<String>,
}

impl From<&ProfileConfig> for SandboxProfile {
    fn from(config: &ProfileConfig) -> Self {
        Self {
            name: config.name.clone(),
            processes: config.processes,
            open_files: config.open_files,
            file_size: config.file_size.0,
            limit_address_space: config.limit_address_space,
            wrapper: config.wrapper.clone(),
            env: config.env.clone(),
            dirs: config.dirs.clone(),
        }
    }
}

/// Everything needed to build and run a program in one language
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub name: String,
    pub source_file: String,
    pub extension: String,
    pub executable: String,
    compile: Option<Vec<String>>,
    run: Vec<String>,
    pub profile: Arc<SandboxProfile>,
    pub remote_id: Option<u32>,
    pub time_limit: Duration,
    /// Default memory limit in bytes
    pub memory_limit: u64,
}

impl Toolchain {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Compile command with placeholders substituted, if the language compiles
    pub fn compile_command(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|template| self.apply_template(template))
    }

    /// Run command with placeholders substituted
    pub fn run_command(&self) -> Vec<String> {
        self.apply_template(&self.run)
    }

    fn apply_template(&self, template: &[String]) -> Vec<String> {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", &self.source_file);
        mapping.insert("%OUTPUT%", &self.executable);

        template
            .iter()
            .map(|s| {
                let mut t = s.clone();
                for (k, v) in mapping.iter() {
                    t = t.replace(k, v);
                }
                t
            })
            .collect()
    }
}

/// Read-only table of supported languages, shared by all concurrent submissions
#[derive(Debug)]
pub struct LanguageRegistry {
    toolchains: HashMap<String, Toolchain>,
}

impl LanguageRegistry {
    /// Builds the registry from configuration, falling back to the built-in tables
    pub fn from_config(languages: &[LanguageConfig], profiles: &[ProfileConfig]) -> Result<Self> {
        let builtin_langs;
        let languages = if languages.is_empty() {
            builtin_langs = builtin_languages();
            &builtin_langs
        } else {
            languages
        };

        let mut profile_map: HashMap<String, Arc<SandboxProfile>> = builtin_profiles()
            .iter()
            .map(|p| (p.name.clone(), Arc::new(SandboxProfile::from(p))))
            .collect();
        for p in profiles {
            profile_map.insert(p.name.clone(), Arc::new(SandboxProfile::from(p)));
        }

        let mut toolchains = HashMap::new();
        for lang in languages {
            if lang.run.is_empty() {
                bail!("language {} has an empty run command", lang.name);
            }
            let Some(profile) = profile_map.get(&lang.profile) else {
                bail!("language {} uses unknown sandbox profile {}", lang.name, lang.profile);
            };
            let extension = lang
                .file_name
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string())
                .unwrap_or_default();

            let toolchain = Toolchain {
                name: lang.name.clone(),
                source_file: lang.file_name.clone(),
                extension,
                executable: EXECUTABLE_NAME.to_string(),
                compile: (!lang.compile.is_empty()).then(|| lang.compile.clone()),
                run: lang.run.clone(),
                profile: Arc::clone(profile),
                remote_id: lang.remote_id,
                time_limit: lang.time_limit.unwrap_or(DEFAULT_TIME_LIMIT).into(),
                memory_limit: lang.memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT).0,
            };

            if toolchains
                .insert(lang.name.to_lowercase(), toolchain)
                .is_some()
            {
                bail!("language {} is defined twice", lang.name);
            }
        }

        log::info!("Language registry loaded with {} languages", toolchains.len());
        Ok(Self { toolchains })
    }

    pub fn builtin() -> Self {
        Self::from_config(&[], &[]).expect("built-in language table is consistent")
    }

    /// Looks up a toolchain by language identifier (case-insensitive)
    pub fn lookup(&self, language: &str) -> Result<&Toolchain, JudgeError> {
        self.toolchains
            .get(&language.to_lowercase())
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Toolchains sorted by name
    pub fn toolchains(&self) -> Vec<&Toolchain> {
        let mut all: Vec<_> = self.toolchains.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

fn builtin_profiles() -> Vec<ProfileConfig> {
    let profile = |name: &str, processes: u32, open_files: u32, limit_address_space: bool| ProfileConfig {
        name: name.to_string(),
        processes,
        open_files,
        file_size: ByteSize(64 << 20),
        limit_address_space,
        wrapper: Vec::new(),
        env: Vec::new(),
        dirs: Vec::new(),
    };

    vec![
        profile("default", 4, 64, true),
        // The JVM and V8 reserve far more address space than they touch
        profile("jvm", 64, 256, false),
        profile("node", 16, 128, false),
    ]
}

fn builtin_languages() -> Vec<LanguageConfig> {
    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    let language = |name: &str,
                    file_name: &str,
                    compile: &[&str],
                    run: &[&str],
                    profile: &str,
                    remote_id: u32| {
        LanguageConfig {
            name: name.to_string(),
            file_name: file_name.to_string(),
            compile: strings(compile),
            run: strings(run),
            profile: profile.to_string(),
            remote_id: Some(remote_id),
            time_limit: None,
            memory_limit: None,
        }
    };

    vec![
        language(
            "c",
            "main.c",
            &["gcc", "-O2", "-std=c11", "-o", "%OUTPUT%", "%INPUT%", "-lm"],
            &["./%OUTPUT%"],
            "default",
            50,
        ),
        language(
            "cpp",
            "main.cpp",
            &["g++", "-O2", "-std=c++17", "-o", "%OUTPUT%", "%INPUT%"],
            &["./%OUTPUT%"],
            "default",
            54,
        ),
        language(
            "rust",
            "main.rs",
            &["rustc", "-O", "-o", "%OUTPUT%", "%INPUT%"],
            &["./%OUTPUT%"],
            "default",
            73,
        ),
        language("python", "main.py", &[], &["python3", "%INPUT%"], "default", 71),
        language(
            "java",
            "Main.java",
            &["javac", "-encoding", "UTF-8", "%INPUT%"],
            &["java", "-Xss64m", "-XX:+UseSerialGC", "Main"],
            "jvm",
            62,
        ),
        language("javascript", "main.js", &[], &["node", "%INPUT%"], "node", 63),
    ]
}
