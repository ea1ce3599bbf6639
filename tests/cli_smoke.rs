use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

fn docfuse_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_docfuse") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("docfuse");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}

fn run(index_dir: &Path, args: &[&str]) -> Result<Output, Box<dyn std::error::Error>> {
    Ok(Command::new(docfuse_bin()?)
        .arg("--index-dir")
        .arg(index_dir)
        .args(["--embedder", "hash:32", "--cross-encoder", "overlap", "-q"])
        .args(args)
        .env_remove("DOCFUSE_LOG")
        .output()?)
}

fn stdout_json(output: &Output) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn create_add_rank_status() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let index = tmp.path().join("index");

    let created = run(&index, &["create", "--analyzer", "fancy"])?;
    assert!(created.status.success());

    let added = run(
        &index,
        &[
            "add",
            "Paris is the capital of France.",
            "Berlin is the capital of Germany.",
        ],
    )?;
    assert!(added.status.success());
    assert_eq!(String::from_utf8(added.stdout)?.lines().count(), 2);

    let ranked = stdout_json(&run(&index, &["rank", "capital of France", "--json"])?)?;
    assert_eq!(ranked["query"], "capital of France");
    assert_eq!(
        ranked["results"][0]["chunk"],
        "Paris is the capital of France."
    );

    let searched = stdout_json(&run(&index, &["search", "Germany", "--json"])?)?;
    assert_eq!(searched["result_count"], 1);
    assert!(searched["results"][0].get("vector").is_none());

    let status = stdout_json(&run(&index, &["status", "--json"])?)?;
    assert_eq!(status["documents"], 2);
    assert_eq!(status["dimension"], 32);
    assert_eq!(status["analyzer"], "fancy");
    assert_eq!(status["embedder"], "hash:32");
    Ok(())
}

#[test]
fn load_docs_and_dataset() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let index = tmp.path().join("index");
    let docs = tmp.path().join("docs");
    std::fs::create_dir_all(docs.join("nested"))?;
    std::fs::write(docs.join("rivers.txt"), "Rivers carry water to the sea.")?;
    std::fs::write(
        docs.join("nested").join("hills.txt"),
        "Forests cover the northern hills.",
    )?;
    std::fs::write(docs.join("ignored.md"), "Markdown is not ingested here.")?;

    let loaded = run(&index, &["load-docs", docs.to_str().unwrap()])?;
    assert!(
        loaded.status.success(),
        "{}",
        String::from_utf8_lossy(&loaded.stderr)
    );

    let csv = tmp.path().join("data.csv");
    std::fs::write(&csv, "key,body\nk1,Deserts receive very little rain.\n")?;
    let dataset = run(
        &index,
        &[
            "load-dataset",
            csv.to_str().unwrap(),
            "--id-column",
            "key",
            "--content-column",
            "body",
        ],
    )?;
    assert!(dataset.status.success());

    let status = stdout_json(&run(&index, &["status", "--json"])?)?;
    assert_eq!(status["documents"], 3);

    let found = stdout_json(&run(&index, &["search", "deserts", "--json"])?)?;
    assert_eq!(found["results"][0]["doc_id"], "k1");
    Ok(())
}

#[test]
fn missing_index_fails() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let output = run(tmp.path(), &["search", "anything"])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("index not found"));
    Ok(())
}

#[test]
fn missing_dataset_column_fails() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let csv = tmp.path().join("data.csv");
    std::fs::write(&csv, "id,text\n1,hello there friend\n")?;

    let output = run(&tmp.path().join("index"), &["load-dataset", csv.to_str().unwrap()])?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("column not found: content"));
    Ok(())
}
