//! モデルアーカイブの中身を表示するバイナリ

use mri_tumor_classifier::model::{load_model_with_metadata, print_metadata_info};
use std::path::PathBuf;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("使い方: inspect_model <model.tar.gz>...");
        std::process::exit(2);
    }

    let mut failed = false;
    for arg in &args[1..] {
        let model_path = PathBuf::from(arg);
        println!("{}", model_path.display());

        match load_model_with_metadata(&model_path) {
            Ok((metadata, binary)) => {
                println!("✓ モデルアーカイブ読み込み成功:");
                print_metadata_info(&metadata);
                println!("重みサイズ: {} bytes", binary.len());
            }
            Err(e) => {
                eprintln!("✗ エラー: {:#}", e);
                failed = true;
            }
        }
        println!("\n{}\n", "=".repeat(50));
    }

    if failed {
        std::process::exit(1);
    }
}
