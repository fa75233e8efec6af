use std::env;
use std::fs;
use std::path::PathBuf;

const SHADERS: &[(&str, shaderc::ShaderKind)] = &[
    ("toy.vert", shaderc::ShaderKind::Vertex),
    ("toy.frag", shaderc::ShaderKind::Fragment),
    ("procedural.frag", shaderc::ShaderKind::Fragment),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap()).join("shaders");
    fs::create_dir_all(&out_dir).unwrap();

    let compiler = shaderc::Compiler::new().unwrap();

    for (name, kind) in SHADERS {
        let path = PathBuf::from("shaders").join(name);
        println!("cargo:rerun-if-changed={}", path.display());

        let source = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
        let compiled = compiler
            .compile_into_spirv(&source, *kind, name, "main", None)
            .unwrap_or_else(|e| panic!("Failed to compile {name}: {e}"));

        fs::write(out_dir.join(format!("{name}.spv")), compiled.as_binary_u8()).unwrap();
    }

    // Precompiled programs are looked up relative to this root at runtime.
    println!("cargo:rustc-env=SHADERS_ROOT={}/", out_dir.display());
}
