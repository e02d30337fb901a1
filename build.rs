fn main() {
    // The soft provider needs nothing from the system.
    #[cfg(feature = "verbs")]
    verbs::gen_bindings();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env::{self, consts};
    use std::path::{Path, PathBuf};

    /// Directory holding `libibverbs` and `libmlx5`: `$VERBS_LIB_DIR`, or the
    /// first standard location that has them.
    fn lib_dir() -> PathBuf {
        let candidates = match env::var_os("VERBS_LIB_DIR") {
            Some(dir) => vec![PathBuf::from(dir)],
            None => ["/usr/lib/x86_64-linux-gnu", "/usr/lib/aarch64-linux-gnu", "/usr/lib64", "/usr/lib"]
                .iter()
                .map(PathBuf::from)
                .collect(),
        };
        let has = |dir: &Path, lib: &str| {
            let dylib = format!("{}{}{}", consts::DLL_PREFIX, lib, consts::DLL_SUFFIX);
            dir.join(dylib).exists() || dir.join(format!("lib{}.a", lib)).exists()
        };
        candidates
            .into_iter()
            .find(|dir| has(dir, "ibverbs") && has(dir, "mlx5"))
            .unwrap_or_else(|| panic!("libibverbs and libmlx5 not found; set VERBS_LIB_DIR"))
    }

    /// Link `libibverbs` and `libmlx5` as installed by rdma-core or
    /// MLNX_OFED 5.x, and generate bindings for them.
    pub fn gen_bindings() {
        if cfg!(not(target_pointer_width = "64")) {
            panic!("the `verbs` backend only supports 64-bit platforms");
        }
        println!("cargo:rerun-if-changed=src/verbs/verbs.h");
        println!("cargo:rerun-if-env-changed=VERBS_LIB_DIR");
        println!("cargo:rerun-if-env-changed=VERBS_INCLUDE_DIR");

        let lib_dir = lib_dir();
        println!("cargo:rustc-link-search=native={}", lib_dir.display());
        println!("cargo:rustc-link-lib=ibverbs");
        println!("cargo:rustc-link-lib=mlx5");

        let mut builder = bindgen::builder();
        if let Some(include_dir) = env::var_os("VERBS_INCLUDE_DIR") {
            builder = builder.clang_arg(format!("-I{}", Path::new(&include_dir).display()));
        }
        let bindings = builder
            .header("src/verbs/verbs.h")
            .allowlist_function("ibv_.*")
            .allowlist_function("mlx5dv_.*")
            .allowlist_type("ibv_.*")
            .allowlist_type("mlx5dv_.*")
            .opaque_type("pthread_.*")
            .blocklist_type("mlx5dv_dc_init_attr")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
        bindings
            .write_to_file(Path::new(&out_dir).join("verbs_bindings.rs"))
            .expect("failed to write bindings");
    }
}
