use taskgate_tools::browser_task::policy::normalize_domains;
use taskgate_tools::browser_task::validate;

/// Prints the destination verdict for `url`; exits non-zero on deny.
pub fn run(url: &str, allowed_domains: Vec<String>) -> anyhow::Result<()> {
    // No `--allow` means no allowlist; blank entries still form one.
    let domains = (!allowed_domains.is_empty()).then(|| normalize_domains(allowed_domains));

    let verdict = validate(url, domains.as_deref());
    println!("{}", verdict);
    if !verdict.is_allowed() {
        anyhow::bail!("{} is not an allowed destination", url);
    }
    Ok(())
}
