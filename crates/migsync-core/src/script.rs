//! Host-script execution: the hook registry, the signature-verified
//! executor, and the pre-execution syntax check.
//!
//! `script` steps carry code the engine cannot interpret itself. A
//! [`ScriptHook`] registered on the runner executes them; the
//! [`ScriptExecutor`] wraps every invocation in signature verification so
//! tampered stored scripts never run.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::HandlerError;
use crate::handler::RollbackRecord;
use crate::signature::Signer;

/// One host-script invocation.
#[derive(Debug)]
pub struct ScriptCall<'a> {
    /// Migration name.
    pub migration: &'a str,
    /// Step index.
    pub step: u32,
    /// Script body.
    pub code: &'a str,
    /// Arguments: decoded query-string pairs at apply time, stored JSON at
    /// rollback time.
    pub args: Value,
}

/// Executes `script` steps on behalf of handlers.
pub trait ScriptHook: Send {
    /// Run the script and return its results (used as rollback arguments).
    fn call(&self, call: &ScriptCall<'_>) -> Result<Value, HandlerError>;
}

/// Signature-verifying façade over the registered [`ScriptHook`].
///
/// Handed to handlers with every apply/rollback dispatch; also exposes
/// plain record verification for step kinds the handler executes itself.
pub struct ScriptExecutor<'a> {
    signer: &'a Signer,
    hook: Option<&'a dyn ScriptHook>,
}

impl std::fmt::Debug for ScriptExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptExecutor")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl<'a> ScriptExecutor<'a> {
    /// Create an executor over the run's signer and optional hook.
    pub fn new(signer: &'a Signer, hook: Option<&'a dyn ScriptHook>) -> Self {
        Self { signer, hook }
    }

    /// Verify a stored record's signature, failing with the dedicated
    /// mismatch error.
    pub fn verify_record(&self, record: &RollbackRecord) -> Result<(), HandlerError> {
        if self.signer.verify_record(record) {
            Ok(())
        } else {
            Err(HandlerError::SignatureMismatch {
                migration: record.migration.clone(),
                step: record.step,
            })
        }
    }

    /// Run a freshly-read apply script after verifying its digest.
    pub fn run_fresh(
        &self,
        migration: &str,
        step: u32,
        code: &str,
        args: &BTreeMap<String, String>,
        signature: &str,
    ) -> Result<Option<Value>, HandlerError> {
        if !self.signer.verify(code, signature) {
            return Err(HandlerError::SignatureMismatch {
                migration: migration.to_string(),
                step,
            });
        }
        let args = Value::Object(
            args.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        self.invoke(migration, step, code, args)
    }

    /// Run a stored rollback script after verifying the whole record.
    pub fn run_stored(&self, record: &RollbackRecord) -> Result<Option<Value>, HandlerError> {
        self.verify_record(record)?;
        let args = record
            .args
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null);
        self.invoke(&record.migration, record.step, &record.code, args)
    }

    fn invoke(
        &self,
        migration: &str,
        step: u32,
        code: &str,
        args: Value,
    ) -> Result<Option<Value>, HandlerError> {
        let hook = self.hook.ok_or(HandlerError::NoScriptHook)?;
        let call = ScriptCall {
            migration,
            step,
            code,
            args,
        };
        let result = hook.call(&call)?;
        Ok(match result {
            Value::Null => None,
            value => Some(value),
        })
    }
}

/// Check a script body for balanced braces before execution.
///
/// Braces inside single/double-quoted strings, comments, and
/// `<<<TAG ... TAG` heredocs do not count. Returns a description of the
/// first imbalance found.
pub fn check_syntax(code: &str) -> Result<(), String> {
    let bytes = code.as_bytes();
    let mut depth: i64 = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some(b'\\') => i += 2,
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            b'#' => i = skip_line(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'/') => i = skip_line(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                loop {
                    match bytes.get(i) {
                        None => return Err("unterminated block comment".to_string()),
                        Some(b'*') if bytes.get(i + 1) == Some(&b'/') => {
                            i += 2;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            b'<' if bytes.get(i + 1) == Some(&b'<') && bytes.get(i + 2) == Some(&b'<') => {
                let mut j = i + 3;
                let start = j;
                while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                    j += 1;
                }
                if j == start {
                    i += 3;
                    continue;
                }
                let tag = &code[start..j];
                i = skip_heredoc(code, j, tag)
                    .ok_or_else(|| format!("unterminated heredoc \"{tag}\""))?;
            }
            b'{' => {
                depth += 1;
                i += 1;
            }
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unexpected closing brace".to_string());
                }
                i += 1;
            }
            _ => i += 1,
        }
    }

    if depth != 0 {
        return Err(format!("{depth} unclosed brace(s)"));
    }
    Ok(())
}

fn skip_line(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

/// Skip past a heredoc body; returns the byte offset after the closing tag
/// line, or `None` when the tag never closes.
fn skip_heredoc(code: &str, from: usize, tag: &str) -> Option<usize> {
    let mut offset = code[from..].find('\n')? + from + 1;
    loop {
        let rest = &code[offset..];
        let line_end = rest.find('\n').map_or(code.len(), |p| offset + p);
        let line = code[offset..line_end].trim();
        if line == tag || line == format!("{tag};") {
            return Some(line_end);
        }
        if line_end == code.len() {
            return None;
        }
        offset = line_end + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHook;

    impl ScriptHook for EchoHook {
        fn call(&self, call: &ScriptCall<'_>) -> Result<Value, HandlerError> {
            Ok(serde_json::json!([call.migration, call.step]))
        }
    }

    #[test]
    fn test_run_fresh_verifies_signature() {
        let signer = Signer::new("secret");
        let hook = EchoHook;
        let executor = ScriptExecutor::new(&signer, Some(&hook));
        let args = BTreeMap::new();
        let good = signer.sign("do_things()");
        assert!(executor
            .run_fresh("app:001", 1, "do_things()", &args, &good)
            .is_ok());
        let result = executor.run_fresh("app:001", 1, "do_things()", &args, "bogus");
        assert!(matches!(
            result,
            Err(HandlerError::SignatureMismatch { step: 1, .. })
        ));
    }

    #[test]
    fn test_run_stored_rejects_tampered_record() {
        let signer = Signer::new("secret");
        let hook = EchoHook;
        let executor = ScriptExecutor::new(&signer, Some(&hook));
        let mut record = RollbackRecord {
            migration: "app:001".to_string(),
            step: 2,
            kind: "script".to_string(),
            args: None,
            code: "undo()".to_string(),
            signature: String::new(),
        };
        record.signature = signer.sign_record(&record);
        assert!(executor.run_stored(&record).is_ok());
        record.code = "undo(); drop_everything()".to_string();
        assert!(matches!(
            executor.run_stored(&record),
            Err(HandlerError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_hook_is_reported() {
        let signer = Signer::new("secret");
        let executor = ScriptExecutor::new(&signer, None);
        let args = BTreeMap::new();
        let signature = signer.sign("noop()");
        assert!(matches!(
            executor.run_fresh("app:001", 1, "noop()", &args, &signature),
            Err(HandlerError::NoScriptHook)
        ));
    }

    #[test]
    fn test_check_syntax_balanced() {
        assert!(check_syntax("fn run() { if x { y() } }").is_ok());
    }

    #[test]
    fn test_check_syntax_unbalanced() {
        assert!(check_syntax("fn run() { if x { y() }").is_err());
        assert!(check_syntax("}").is_err());
    }

    #[test]
    fn test_check_syntax_ignores_strings_and_comments() {
        assert!(check_syntax("run(\"{\") # {\n").is_ok());
        assert!(check_syntax("run('}') // }\n").is_ok());
        assert!(check_syntax("/* { */ run()").is_ok());
    }

    #[test]
    fn test_check_syntax_ignores_heredoc() {
        let code = "send(<<<EOT\n{ not a brace }\n{{{\nEOT\n);";
        assert!(check_syntax(code).is_ok());
    }

    #[test]
    fn test_check_syntax_unterminated_heredoc() {
        assert!(check_syntax("send(<<<EOT\n{ never closed").is_err());
    }

    #[test]
    fn test_check_syntax_unterminated_string() {
        assert!(check_syntax("run(\"oops")
            .unwrap_err()
            .contains("unterminated"));
    }
}
