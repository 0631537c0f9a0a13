// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Per-signer override flags
//!
//! The flags depend on the configured signers, so the command line is parsed
//! twice: once to find the configuration file, once with a flag set per
//! signer. With a single signer the flags are plain (`--reason`); with
//! several each carries the signer name (`--reason_simple`).

use clap::{value_parser, Arg, ArgMatches, Command};
use pdfsign_core::config::SignerOverrides;
use std::path::PathBuf;

const HEADING: &str = "Signer overrides";

/// (flag, help)
const FLAGS: &[(&str, &str)] = &[
    ("type", "Certificate type (1 certification, 2 approval, 3 usage rights, 4 timestamp)"),
    ("docmdp", "DocMDP permissions (1 no changes, 2 fill forms, 3 annotate)"),
    ("name", "Signer name"),
    ("location", "Signing location"),
    ("reason", "Signing reason"),
    ("contact", "Signer contact information"),
    ("tsa-url", "Time-stamping authority URL"),
    ("tsa-username", "Time-stamping authority user"),
    ("tsa-password", "Time-stamping authority password"),
    ("chain", "Certificate chain file"),
];

fn flag_id(flag: &str, signer: &str, qualified: bool) -> String {
    if qualified {
        format!("{}_{}", flag, signer)
    } else {
        flag.to_string()
    }
}

/// Add the override flags of every signer to `command`
pub fn add_signer_flags(mut command: Command, signers: &[String]) -> Command {
    let qualified = signers.len() > 1;
    for signer in signers {
        for (flag, help) in FLAGS {
            let id = flag_id(flag, signer, qualified);
            let help = if qualified {
                format!("{} for signer '{}'", help, signer)
            } else {
                help.to_string()
            };

            let arg = Arg::new(id.clone())
                .long(id)
                .help(help)
                .help_heading(HEADING);
            let arg = match *flag {
                "type" | "docmdp" => arg.value_parser(value_parser!(u32)),
                "chain" => arg.value_parser(value_parser!(PathBuf)),
                _ => arg,
            };
            command = command.arg(arg);
        }
    }
    command
}

/// Overrides given for `signer`, `None` when no flag was used
pub fn overrides_for(matches: &ArgMatches, signer: &str, qualified: bool) -> Option<SignerOverrides> {
    let string = |flag: &str| {
        matches
            .try_get_one::<String>(&flag_id(flag, signer, qualified))
            .ok()
            .flatten()
            .cloned()
    };
    let number = |flag: &str| {
        matches
            .try_get_one::<u32>(&flag_id(flag, signer, qualified))
            .ok()
            .flatten()
            .copied()
    };

    let overrides = SignerOverrides {
        cert_type: number("type"),
        doc_mdp: number("docmdp"),
        name: string("name"),
        location: string("location"),
        reason: string("reason"),
        contact: string("contact"),
        tsa_url: string("tsa-url"),
        tsa_username: string("tsa-username"),
        tsa_password: string("tsa-password"),
        chain: matches
            .try_get_one::<PathBuf>(&flag_id("chain", signer, qualified))
            .ok()
            .flatten()
            .cloned(),
    };

    (overrides != SignerOverrides::default()).then_some(overrides)
}

/// Find `--config`/`-c` before the full command line can be parsed
pub fn config_path(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        }
        if arg == "--config" || arg == "-c" {
            return iter.next().map(PathBuf::from);
        }
    }
    None
}
