use std::collections::HashMap;

use serde::Serialize;

/// Placeholder replaced by the source file path inside the sandbox
pub const SOURCE_PLACEHOLDER: &str = "%SOURCE%";
/// Placeholder replaced by the build directory inside the sandbox
pub const BUILD_PLACEHOLDER: &str = "%BUILD%";

/// A shell command with `%SOURCE%` / `%BUILD%` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(Vec<&'static str>);

impl CommandTemplate {
    fn new(parts: &[&'static str]) -> Self {
        Self(parts.to_vec())
    }

    /// Applies placeholder substitutions and joins the result into a single command string
    pub fn render(&self, source_path: &str, build_dir: &str) -> String {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert(SOURCE_PLACEHOLDER, source_path);
        mapping.insert(BUILD_PLACEHOLDER, build_dir);

        self.0
            .iter()
            .map(|part| {
                let mut t = part.to_string();
                for (k, v) in mapping.iter() {
                    t = t.replace(k, v);
                }
                t
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How one language is compiled and run inside the sandbox
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    pub id: &'static str,
    pub aliases: &'static [&'static str],
    /// File name the source is written under; Java needs the public class name
    pub source_name: &'static str,
    pub image: String,
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
}

impl LanguageProfile {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }
}

/// Summary used by the `/languages` endpoint
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct LanguageSummary {
    pub id: &'static str,
    pub aliases: &'static [&'static str],
    pub compiled: bool,
}

impl From<&LanguageProfile> for LanguageSummary {
    fn from(profile: &LanguageProfile) -> Self {
        Self {
            id: profile.id,
            aliases: profile.aliases,
            compiled: profile.is_compiled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

/// Immutable lookup table from language identifier to profile
#[derive(Debug)]
pub struct LanguageRegistry {
    profiles: Vec<LanguageProfile>,
}

impl LanguageRegistry {
    /// Builds the registry from the built-in profiles, replacing images listed in `images`
    pub fn with_images(images: &HashMap<String, String>) -> Self {
        let mut profiles = builtin_profiles();
        for (language, image) in images {
            match profiles
                .iter_mut()
                .find(|p| p.id.eq_ignore_ascii_case(language))
            {
                Some(profile) => {
                    log::info!("Using image {image} for language {}", profile.id);
                    profile.image = image.clone();
                }
                None => log::warn!("Ignoring image override for unknown language {language}"),
            }
        }
        Self { profiles }
    }

    /// Looks up a profile by id or alias, ignoring case and surrounding whitespace
    pub fn resolve(&self, language: &str) -> Result<&LanguageProfile, UnsupportedLanguage> {
        let wanted = language.trim();
        self.profiles
            .iter()
            .find(|p| {
                p.id.eq_ignore_ascii_case(wanted)
                    || p.aliases.iter().any(|a| a.eq_ignore_ascii_case(wanted))
            })
            .ok_or_else(|| UnsupportedLanguage(wanted.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.iter()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self {
            profiles: builtin_profiles(),
        }
    }
}

fn builtin_profiles() -> Vec<LanguageProfile> {
    vec![
        LanguageProfile {
            id: "c",
            aliases: &[],
            source_name: "main.c",
            image: "gcc:13".to_string(),
            compile: Some(CommandTemplate::new(&[
                "gcc", "-O2", "-std=c17", "-o", "%BUILD%/main", "%SOURCE%", "-lm",
            ])),
            run: CommandTemplate::new(&["%BUILD%/main"]),
        },
        LanguageProfile {
            id: "cpp",
            aliases: &["c++", "cxx"],
            source_name: "main.cpp",
            image: "gcc:13".to_string(),
            compile: Some(CommandTemplate::new(&[
                "g++", "-O2", "-std=c++17", "-o", "%BUILD%/main", "%SOURCE%",
            ])),
            run: CommandTemplate::new(&["%BUILD%/main"]),
        },
        LanguageProfile {
            id: "java",
            aliases: &[],
            source_name: "Main.java",
            image: "eclipse-temurin:21-jdk".to_string(),
            compile: Some(CommandTemplate::new(&["javac", "-d", "%BUILD%", "%SOURCE%"])),
            run: CommandTemplate::new(&["java", "-XX:+UseSerialGC", "-Xss64m", "-cp", "%BUILD%", "Main"]),
        },
        LanguageProfile {
            id: "rust",
            aliases: &["rs"],
            source_name: "main.rs",
            image: "rust:1-slim".to_string(),
            compile: Some(CommandTemplate::new(&[
                "rustc", "-O", "-o", "%BUILD%/main", "%SOURCE%",
            ])),
            run: CommandTemplate::new(&["%BUILD%/main"]),
        },
        LanguageProfile {
            id: "python",
            aliases: &["python3", "py"],
            source_name: "main.py",
            image: "python:3.12-slim".to_string(),
            compile: None,
            run: CommandTemplate::new(&["python3", "-u", "%SOURCE%"]),
        },
        LanguageProfile {
            id: "javascript",
            aliases: &["js", "node", "nodejs"],
            source_name: "main.js",
            image: "node:20-slim".to_string(),
            compile: None,
            run: CommandTemplate::new(&["node", "%SOURCE%"]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_by_id_and_alias() {
        let registry = LanguageRegistry::default();
        assert_eq!(registry.resolve("python").unwrap().id, "python");
        assert_eq!(registry.resolve("Python3").unwrap().id, "python");
        assert_eq!(registry.resolve(" C++ ").unwrap().id, "cpp");
        assert_eq!(registry.resolve("node").unwrap().id, "javascript");
    }

    #[test]
    fn test_resolve_unknown_language() {
        let registry = LanguageRegistry::default();
        assert_eq!(
            registry.resolve("cobol").unwrap_err(),
            UnsupportedLanguage("cobol".to_string())
        );
        assert!(registry.resolve("").is_err());
    }

    #[test]
    fn test_compiled_and_interpreted_families() {
        let registry = LanguageRegistry::default();
        for id in ["c", "cpp", "java", "rust"] {
            assert!(registry.resolve(id).unwrap().is_compiled(), "{id}");
        }
        for id in ["python", "javascript"] {
            assert!(!registry.resolve(id).unwrap().is_compiled(), "{id}");
        }
    }

    #[test]
    fn test_render_command_template() {
        let registry = LanguageRegistry::default();
        let c = registry.resolve("c").unwrap();
        assert_eq!(
            c.compile
                .as_ref()
                .unwrap()
                .render("/sandbox/src/main.c", "/sandbox/build"),
            "gcc -O2 -std=c17 -o /sandbox/build/main /sandbox/src/main.c -lm"
        );
        assert_eq!(
            c.run.render("/sandbox/src/main.c", "/sandbox/build"),
            "/sandbox/build/main"
        );

        let java = registry.resolve("java").unwrap();
        assert_eq!(java.source_name, "Main.java");
        assert_eq!(
            java.run.render("/sandbox/src/Main.java", "/sandbox/build"),
            "java -XX:+UseSerialGC -Xss64m -cp /sandbox/build Main"
        );
    }

    #[test]
    fn test_image_overrides() {
        let images = HashMap::from([
            ("Python".to_string(), "python:3.11-alpine".to_string()),
            ("brainfuck".to_string(), "bf:latest".to_string()),
        ]);
        let registry = LanguageRegistry::with_images(&images);
        assert_eq!(registry.resolve("py").unwrap().image, "python:3.11-alpine");
        assert_eq!(registry.resolve("c").unwrap().image, "gcc:13");
        assert!(registry.resolve("brainfuck").is_err());
    }

    #[test]
    fn test_list_is_stable() {
        let registry = LanguageRegistry::default();
        let ids: Vec<_> = registry.list().map(|p| p.id).collect();
        assert_eq!(ids, ["c", "cpp", "java", "rust", "python", "javascript"]);
    }
}
