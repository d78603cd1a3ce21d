//! `fortify-shim`: runs as the target user and drives the container.
//!
//! Exec'd by the identity-switch helper; reads its parameters from the
//! descriptor named by `FORTIFY_SHIM`.

fn main() {
    fortify::shim::main()
}
