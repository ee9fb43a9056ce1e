//! Command builders for forge.

use std::path::Path;

use alloy_core::primitives::Address;

/// Gas price forced on networks whose receipts get stuck at the default price.
pub const STALLED_NETWORK_GAS_PRICE: u128 = 100_000_000_000;

/// Networks where transactions stall without an explicit gas price.
const STALLED_NETWORKS: &[&str] = &["base-sepolia"];

pub fn is_stalled_network(network: &str) -> bool {
    STALLED_NETWORKS.contains(&network)
}

/// How forge signs transactions.
#[derive(Clone, PartialEq, Eq)]
pub enum ForgeAuth {
    Ledger { index: u32, sender: Address },
    PrivateKey(String),
}

impl std::fmt::Debug for ForgeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ledger { index, sender } => f
                .debug_struct("Ledger")
                .field("index", index)
                .field("sender", sender)
                .finish(),
            Self::PrivateKey(_) => f.write_str("PrivateKey(<redacted>)"),
        }
    }
}

impl ForgeAuth {
    fn args(&self) -> Vec<String> {
        match self {
            Self::Ledger { index, sender } => vec![
                "--ledger".to_string(),
                "--mnemonic-indexes".to_string(),
                index.to_string(),
                "--sender".to_string(),
                sender.to_string(),
            ],
            Self::PrivateKey(key) => vec!["--private-key".to_string(), key.clone()],
        }
    }
}

/// Builder for `forge script` commands.
#[derive(Debug, Clone)]
pub struct ForgeScriptCmdBuilder {
    script_path: String,
    contract: String,
    rpc_url: String,
    chain_id: u64,
    auth: Option<ForgeAuth>,
    broadcast: bool,
    slow: bool,
    gas_price: Option<u128>,
    resume: bool,
    verify: bool,
    extra_args: Vec<String>,
}

impl ForgeScriptCmdBuilder {
    /// Create a builder running `contract` from the script at `script_path`.
    pub fn new(
        script_path: impl AsRef<Path>,
        contract: impl Into<String>,
        rpc_url: impl Into<String>,
        chain_id: u64,
    ) -> Self {
        Self {
            script_path: script_path.as_ref().display().to_string(),
            contract: contract.into(),
            rpc_url: rpc_url.into(),
            chain_id,
            auth: None,
            broadcast: true,
            slow: false,
            gas_price: None,
            resume: false,
            verify: false,
            extra_args: Vec::new(),
        }
    }

    pub fn auth(mut self, auth: ForgeAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Send the transactions. Disabled for dry runs.
    pub fn broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Wait for each receipt before sending the next transaction.
    pub fn slow(mut self, slow: bool) -> Self {
        self.slow = slow;
        self
    }

    pub fn gas_price(mut self, gas_price: Option<u128>) -> Self {
        self.gas_price = gas_price;
        self
    }

    /// Continue the previous broadcast of this script.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Submit sources to the explorer.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Arguments of the run that submits the sources of a finished broadcast.
    pub fn source_submission(&self) -> Vec<String> {
        self.clone().verify(true).build()
    }

    /// Build the arguments following `forge`.
    pub fn build(self) -> Vec<String> {
        let mut cmd = vec![
            "script".to_string(),
            self.script_path,
            "--tc".to_string(),
            self.contract,
            "--optimize".to_string(),
            "--rpc-url".to_string(),
            self.rpc_url,
            "--chain-id".to_string(),
            self.chain_id.to_string(),
        ];

        if let Some(auth) = &self.auth {
            cmd.extend(auth.args());
        }

        cmd.extend(self.extra_args);

        if self.broadcast {
            cmd.push("--broadcast".to_string());
        }

        if let Some(gas_price) = self.gas_price {
            cmd.push("--gas-price".to_string());
            cmd.push(gas_price.to_string());
        }

        if self.slow {
            cmd.push("--slow".to_string());
        }

        if self.verify {
            cmd.push("--verify".to_string());
        }

        if (self.resume || self.verify) && !cmd.iter().any(|a| a == "--resume") {
            cmd.push("--resume".to_string());
        }

        cmd
    }
}

/// `forge build` arguments for the one-time build of a release.
pub fn build_args(threads: usize) -> Vec<String> {
    vec![
        "build".to_string(),
        "--threads".to_string(),
        threads.to_string(),
        "--skip".to_string(),
        "test".to_string(),
        "--deny-warnings".to_string(),
    ]
}

/// Render a command for logs, hiding keys and RPC credentials.
pub fn display_redacted(program: &str, args: &[String]) -> String {
    let mut rendered = vec![program.to_string()];
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            rendered.push(if arg.starts_with("http") {
                crate::environment::redact(arg)
            } else {
                "<redacted>".to_string()
            });
            hide_next = false;
            continue;
        }
        hide_next = arg == "--private-key" || arg == "--rpc-url";
        rendered.push(arg.clone());
    }
    rendered.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ForgeScriptCmdBuilder {
        ForgeScriptCmdBuilder::new(
            "/repo/script/LaunchDeployer.s.sol",
            "LaunchDeployer",
            "https://eth-sepolia.g.alchemy.com/v2/KEY",
            11155111,
        )
    }

    #[test]
    fn test_forge_script_cmd_builder() {
        let cmd = builder()
            .auth(ForgeAuth::PrivateKey("0xabc".to_string()))
            .extra_args(["-vvvv"])
            .build();

        assert_eq!(cmd[0], "script");
        assert_eq!(cmd[1], "/repo/script/LaunchDeployer.s.sol");
        assert!(cmd.windows(2).any(|w| w == ["--tc", "LaunchDeployer"]));
        assert!(cmd.windows(2).any(|w| w == ["--chain-id", "11155111"]));
        assert!(cmd.windows(2).any(|w| w == ["--private-key", "0xabc"]));
        assert!(cmd.contains(&"--broadcast".to_string()));
        assert!(cmd.contains(&"-vvvv".to_string()));
        assert!(!cmd.contains(&"--resume".to_string()));
        assert!(!cmd.contains(&"--slow".to_string()));
    }

    #[test]
    fn test_dry_run_resume_and_stalled_network() {
        let cmd = builder()
            .broadcast(false)
            .resume(true)
            .slow(true)
            .gas_price(Some(STALLED_NETWORK_GAS_PRICE))
            .build();

        assert!(!cmd.contains(&"--broadcast".to_string()));
        assert!(cmd.contains(&"--resume".to_string()));
        assert!(cmd.windows(2).any(|w| w == ["--gas-price", "100000000000"]));
        assert!(is_stalled_network("base-sepolia"));
        assert!(!is_stalled_network("sepolia"));
    }

    #[test]
    fn test_verify_implies_resume_once() {
        let cmd = builder()
            .extra_args(["--resume"])
            .verify(true)
            .build();
        assert!(cmd.contains(&"--verify".to_string()));
        assert_eq!(cmd.iter().filter(|a| *a == "--resume").count(), 1);
    }

    #[test]
    fn test_source_submission_reruns_the_broadcast() {
        let cmd = builder()
            .auth(ForgeAuth::PrivateKey("0xsecret".to_string()))
            .broadcast(true)
            .resume(true);
        let run = cmd.clone().build();
        let submission = cmd.source_submission();

        assert!(!run.contains(&"--verify".to_string()));
        assert_eq!(submission.iter().filter(|a| *a == "--verify").count(), 1);
        assert_eq!(submission.iter().filter(|a| *a == "--resume").count(), 1);
        // Same script, target and signer as the broadcast it follows.
        assert!(run.iter().all(|a| submission.contains(a)));
    }

    #[test]
    fn test_ledger_auth() {
        let sender: Address = "0x423420Ae467df6e90291fd0252c0A8a637C1e03f".parse().unwrap();
        let cmd = builder()
            .auth(ForgeAuth::Ledger { index: 1, sender })
            .build();
        assert!(cmd.windows(2).any(|w| w == ["--mnemonic-indexes", "1"]));
        assert!(cmd.contains(&"--ledger".to_string()));
        assert!(cmd.contains(&"--sender".to_string()));
    }

    #[test]
    fn test_display_redacted() {
        let cmd = builder()
            .auth(ForgeAuth::PrivateKey("0xsecret".to_string()))
            .build();
        let rendered = display_redacted("forge", &cmd);

        assert!(rendered.starts_with("forge script"));
        assert!(!rendered.contains("0xsecret"));
        assert!(!rendered.contains("KEY"));
        assert!(rendered.contains("--rpc-url https://eth-sepolia.g.alchemy.com "));
    }

    #[test]
    fn test_build_args() {
        assert_eq!(
            build_args(8).join(" "),
            "build --threads 8 --skip test --deny-warnings"
        );
    }

    #[test]
    fn test_auth_debug_hides_key() {
        let auth = ForgeAuth::PrivateKey("0xsecret".to_string());
        assert!(!format!("{:?}", auth).contains("0xsecret"));
    }
}
