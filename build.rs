use std::env;

/// Build flow:
///
/// 1. Refuse non-64-bit targets.
/// 2. Without the `ibverbs` feature, nothing native is needed.
/// 3. Otherwise link `libibverbs` (through `pkg-config` when it is registered there)
///    and generate bindings for the subset of verbs the hardware provider uses.
fn main() {
    // `cfg!` would describe the host running this script, not the target.
    if env::var("CARGO_CFG_TARGET_POINTER_WIDTH").as_deref() != Ok("64") {
        panic!("`udverbs` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "ibverbs")]
    {
        println!("cargo:rerun-if-changed=src/bindings/verbs.h");
        println!("cargo:rerun-if-env-changed=IBVERBS_INCLUDE_DIR");
        println!("cargo:rerun-if-env-changed=IBVERBS_LIB_DIR");
        let include_dirs = link_ibverbs();
        gen_verb_bindings(include_dirs);
    }
}

/// Link to `libibverbs` and return the extra include directories to hand to `bindgen`.
#[cfg(feature = "ibverbs")]
fn link_ibverbs() -> Vec<String> {
    if let Ok(lib) = pkg_config::Config::new()
        .statik(false)
        .probe("libibverbs")
    {
        return lib
            .include_paths
            .iter()
            .filter_map(|p| p.to_str().map(str::to_owned))
            .collect();
    }

    // MLNX_OFED v4.x does not register itself to `pkg-config`; assume the
    // default `/usr` installation unless told otherwise.
    let lib_dir = env::var("IBVERBS_LIB_DIR").unwrap_or_else(|_| "/usr/lib".to_owned());
    println!("cargo:rustc-link-search=native={}", lib_dir);
    println!("cargo:rustc-link-lib=ibverbs");
    env::var("IBVERBS_INCLUDE_DIR").map(|d| vec![d]).unwrap_or_default()
}

#[cfg(feature = "ibverbs")]
fn gen_verb_bindings(include_dirs: Vec<String>) {
    use std::path::Path;

    let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
    let bindings = bindgen::builder()
        .clang_args(include_args)
        .header("src/bindings/verbs.h")
        .allowlist_function("ibv_.*")
        .allowlist_type("ibv_.*")
        .opaque_type("pthread_.*")
        .blocklist_type("in6_addr")
        .blocklist_type("sockaddr.*")
        .blocklist_type("timespec")
        .blocklist_type("ibv_ah_attr")
        .blocklist_type("ibv_gid")
        .blocklist_type("ibv_global_route")
        .blocklist_type("ibv_send_wr")
        .blocklist_type("ibv_wc")
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_qp_attr_mask")
        .bitfield_enum("ibv_send_flags")
        .bitfield_enum("ibv_wc_flags")
        .constified_enum_module("ibv_mtu")
        .constified_enum_module("ibv_port_state")
        .constified_enum_module("ibv_qp_state")
        .constified_enum_module("ibv_qp_type")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("ibv_wr_opcode")
        .constified_enum_module("ibv_mig_state")
        .constified_enum_module("ibv_mw_type")
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(true)
        .generate_comments(false)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true)
        .disable_untagged_union()
        .generate()
        .expect("failed to generate bindings");

    let out_dir = env::var_os("OUT_DIR").expect("cargo always sets OUT_DIR");
    let dest = Path::new(&out_dir).join("verbs_bindings.rs");
    bindings
        .write_to_file(dest)
        .expect("failed to write bindings");
}
