use std::{env, path::PathBuf};

use clap::{ArgAction, Parser};

#[derive(Debug, Parser)]
#[command(
    name = "curlrevshell",
    about = "Even worse reverse shell, powered by cURL"
)]
struct RawArgs {
    /// Listen address
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:4444")]
    listen_address: String,
    /// Optional directory (or single file) from which to serve static files
    #[arg(long, value_name = "DIR")]
    serve_files_from: Option<PathBuf>,
    /// Optional callback template file, re-read for every generated script
    #[arg(long, value_name = "FILE")]
    callback_template: Option<PathBuf>,
    /// Write the default callback template to stdout and exit
    #[arg(long, action = ArgAction::SetTrue)]
    print_default_template: bool,
    /// File in which to cache the generated TLS certificate; pass an empty
    /// value to generate a fresh certificate every start
    #[arg(long, value_name = "FILE", value_parser = clap::value_parser!(std::ffi::OsString))]
    tls_certificate_cache: Option<std::ffi::OsString>,
    /// Don't print timestamps
    #[arg(long, action = ArgAction::SetTrue)]
    no_timestamps: bool,
    /// Terminal prompt; don't forget a trailing space
    #[arg(long, value_name = "PROMPT", default_value = "> ")]
    prompt: String,
    /// Additional callback address or domain for one-liner printing (may be
    /// repeated)
    #[arg(long = "callback-address", value_name = "ADDR")]
    callback_addresses: Vec<String>,
    /// Also print IPv6 addresses in one-liners
    #[arg(long, action = ArgAction::SetTrue)]
    ipv6_one_liners: bool,
    /// Close the listener after the first shell connects and exit when it's
    /// gone
    #[arg(long, action = ArgAction::SetTrue)]
    one_shell: bool,
    /// Structured log file (defaults to $CURLREVSHELL_LOG)
    #[arg(long, value_name = "FILE")]
    log: Option<PathBuf>,
    /// File whose contents the :insert command sends to the shell
    #[arg(long, value_name = "FILE")]
    insert_from: Option<PathBuf>,
}

/// Parsed and defaulted configuration for the whole program.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_address: String,
    pub serve_files_from: Option<PathBuf>,
    pub callback_template: Option<PathBuf>,
    pub print_default_template: bool,
    pub tls_certificate_cache: Option<PathBuf>,
    pub no_timestamps: bool,
    pub prompt: String,
    pub callback_addresses: Vec<String>,
    pub ipv6_one_liners: bool,
    pub one_shell: bool,
    pub log: Option<PathBuf>,
    pub insert_from: Option<PathBuf>,
}

impl Config {
    pub fn parse() -> Self {
        RawArgs::parse().into()
    }
}

impl From<RawArgs> for Config {
    fn from(args: RawArgs) -> Self {
        let tls_certificate_cache = match args.tls_certificate_cache {
            Some(p) if p.is_empty() => None,
            Some(p) => Some(PathBuf::from(p)),
            None => default_cert_file(),
        };
        let log = args.log.or_else(|| {
            env::var_os("CURLREVSHELL_LOG")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });

        Self {
            listen_address: args.listen_address,
            serve_files_from: args.serve_files_from,
            callback_template: args.callback_template,
            print_default_template: args.print_default_template,
            tls_certificate_cache,
            no_timestamps: args.no_timestamps,
            prompt: args.prompt,
            callback_addresses: args.callback_addresses,
            ipv6_one_liners: args.ipv6_one_liners,
            one_shell: args.one_shell,
            log,
            insert_from: args.insert_from,
        }
    }
}

/// A path for the default certificate cache file.
///
/// Tries the user cache directory, then a dot-directory under `$HOME`, then
/// the current directory.
fn default_cert_file() -> Option<PathBuf> {
    const CACHE_DIR: &str = "curlrevshell";
    const CACHE_FILE: &str = "cert.txtar";

    if let Some(cache) = env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(cache).join(CACHE_DIR).join(CACHE_FILE));
    }
    if let Some(home) = env::var_os("HOME").filter(|v| !v.is_empty()) {
        return Some(
            PathBuf::from(home)
                .join(format!(".{CACHE_DIR}"))
                .join(CACHE_FILE),
        );
    }
    Some(PathBuf::from(format!(".{CACHE_DIR}")).join(CACHE_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["curlrevshell"];
        argv.extend_from_slice(args);
        RawArgs::try_parse_from(argv).unwrap().into()
    }

    #[test]
    fn defaults_are_sensible() {
        let cfg = parse(&[]);
        assert_eq!(cfg.listen_address, "0.0.0.0:4444");
        assert_eq!(cfg.prompt, "> ");
        assert!(!cfg.one_shell);
        assert!(cfg.tls_certificate_cache.is_some());
    }

    #[test]
    fn empty_cache_path_disables_caching() {
        let cfg = parse(&["--tls-certificate-cache", ""]);
        assert!(cfg.tls_certificate_cache.is_none());
    }

    #[test]
    fn callback_addresses_accumulate() {
        let cfg = parse(&[
            "--callback-address",
            "kittens.com",
            "--callback-address",
            "10.0.0.1:443",
        ]);
        assert_eq!(
            cfg.callback_addresses,
            vec!["kittens.com".to_string(), "10.0.0.1:443".to_string()],
        );
    }
}
