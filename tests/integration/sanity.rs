use assert_cmd::Command;
use predicates::prelude::*;

/// The sanity check must echo the token verbatim and exit 0 without
/// ever starting the program body (no listener, so an instant exit).
#[test]
fn sanity_token_is_echoed_verbatim() {
    let mut cmd = Command::cargo_bin("hotswap-demo").expect("demo binary");
    cmd.env("BIN_CHECK", "abc123")
        .assert()
        .success()
        .stdout(predicate::eq("abc123"));
}

/// The legacy variable name still works.
#[test]
fn legacy_sanity_variable_is_honored() {
    let mut cmd = Command::cargo_bin("hotswap-demo").expect("demo binary");
    cmd.env("GO_UPGRADE_BIN_CHECK", "legacy-token")
        .assert()
        .success()
        .stdout(predicate::eq("legacy-token"));
}

/// An empty token means no sanity check was requested; the preferred
/// variable wins over the legacy one.
#[test]
fn preferred_variable_wins_over_legacy() {
    let mut cmd = Command::cargo_bin("hotswap-demo").expect("demo binary");
    cmd.env("BIN_CHECK", "preferred")
        .env("GO_UPGRADE_BIN_CHECK", "legacy")
        .assert()
        .success()
        .stdout(predicate::eq("preferred"));
}
