use std::collections::BTreeMap;

use crate::engine::error::RunnerError;

/// A single child-process invocation inside a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: &'static str,
    pub args: &'static [&'static str],
    /// Run through `sh -c` instead of exec'ing `program` directly.
    pub shell: bool,
}

impl CommandSpec {
    pub const fn exec(program: &'static str, args: &'static [&'static str]) -> Self {
        Self {
            program,
            args,
            shell: false,
        }
    }

    pub const fn shell(script: &'static str) -> Self {
        Self {
            program: script,
            args: &[],
            shell: true,
        }
    }

    /// Program and argument vector as handed to the OS.
    pub fn argv(&self) -> (String, Vec<String>) {
        if self.shell {
            let mut script = self.program.to_string();
            for arg in self.args {
                script.push(' ');
                script.push_str(arg);
            }
            ("sh".to_string(), vec!["-c".to_string(), script])
        } else {
            (
                self.program.to_string(),
                self.args.iter().map(ToString::to_string).collect(),
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub source_file: &'static str,
    pub compile: Option<CommandSpec>,
    pub run: CommandSpec,
}

impl LanguageSpec {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct LanguageTable {
    specs: BTreeMap<&'static str, LanguageSpec>,
}

impl LanguageTable {
    pub fn builtin() -> Self {
        Self::from_entries([
            (
                "php",
                LanguageSpec {
                    source_file: "code.php",
                    compile: None,
                    run: CommandSpec::exec("php", &["code.php"]),
                },
            ),
            (
                "python",
                LanguageSpec {
                    source_file: "code.py",
                    compile: None,
                    run: CommandSpec::exec("python3", &["code.py"]),
                },
            ),
            (
                "node",
                LanguageSpec {
                    source_file: "code.js",
                    compile: None,
                    run: CommandSpec::exec("node", &["code.js"]),
                },
            ),
            (
                "java",
                LanguageSpec {
                    source_file: "Main.java",
                    compile: Some(CommandSpec::exec("javac", &["Main.java"])),
                    run: CommandSpec::exec("java", &["Main"]),
                },
            ),
            (
                "cpp",
                LanguageSpec {
                    source_file: "code.cpp",
                    compile: Some(CommandSpec::exec("g++", &["code.cpp", "-o", "code"])),
                    run: CommandSpec::exec("./code", &[]),
                },
            ),
        ])
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, LanguageSpec)>,
    {
        Self {
            specs: entries.into_iter().collect(),
        }
    }

    pub fn lookup(&self, language: &str) -> Result<&LanguageSpec, RunnerError> {
        self.specs
            .get(language)
            .ok_or_else(|| RunnerError::UnsupportedLanguage(language.to_string()))
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.specs.keys().copied().collect()
    }
}

impl Default for LanguageTable {
    fn default() -> Self {
        Self::builtin()
    }
}
