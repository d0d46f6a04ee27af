//! Thin CLI wrapping [`sqlite_blast_writer::Handle`]. This binary — and its
//! CSV parsing — is the "external collaborator" spec §1 calls out as
//! deliberately out of scope for the core engine: it exists to exercise the
//! core-facing contract of spec §6, not to be a faithful reimplementation of
//! the original project's own ingestion tooling (dataset-specific parsing,
//! statistics printing, the appendix/bottom-up builder).
//!
//! ```text
//! -c <file> <page_size> <tbl> <n_total> <n_pk> <col_csv>   create
//! -i <file> <page_size> <n_total> <n_pk> <csv> ...         insert rows
//! -r <file> <page_size> <n_total> <n_pk> <pk_csv>          look up and print
//! -t                                                       run self-tests
//! ```

use std::process::ExitCode;

use sqlite_blast_writer::{Handle, Value};

fn default_columns(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("c{i}")).collect()
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',').map(|field| field.to_string()).collect()
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let flag = args.get(1).map(String::as_str).unwrap_or("");

    match flag {
        "-c" => {
            let file = &args[2];
            let page_size: u32 = args[3].parse()?;
            let tbl = args[4].clone();
            let _n_total: usize = args[5].parse()?;
            let n_pk: usize = args[6].parse()?;
            let columns = split_csv(&args[7]);

            let db = Handle::open(file, page_size, 4096, n_pk, columns, tbl)?;
            db.close()?;
            println!("created {file}");
            Ok(())
        }
        "-i" => {
            let file = &args[2];
            let page_size: u32 = args[3].parse()?;
            let n_total: usize = args[4].parse()?;
            let n_pk: usize = args[5].parse()?;

            let mut db = Handle::open(file, page_size, 4096, n_pk, default_columns(n_total), String::new())?;
            let mut inserted = 0usize;
            for row_csv in &args[6..] {
                let fields = split_csv(row_csv);
                if fields.len() != n_total {
                    anyhow::bail!("row has {} fields, expected {n_total}: {row_csv}", fields.len());
                }
                let values: Vec<Value> = fields.iter().map(|f| Value::Text(f.as_bytes())).collect();
                let record = Handle::make_new_rec(&values);
                db.put_record(&record)?;
                inserted += 1;
            }
            db.flush()?;
            println!("inserted {inserted} rows");
            Ok(())
        }
        "-r" => {
            let file = &args[2];
            let page_size: u32 = args[3].parse()?;
            let _n_total: usize = args[4].parse()?;
            let n_pk: usize = args[5].parse()?;
            let pk_fields = split_csv(&args[6]);
            if pk_fields.len() != n_pk {
                anyhow::bail!("expected {n_pk} pk columns, got {}", pk_fields.len());
            }

            let mut db = Handle::open(file, page_size, 4096, n_pk, default_columns(n_pk), String::new())?;
            let key_values: Vec<Value> = pk_fields.iter().map(|f| Value::Text(f.as_bytes())).collect();
            let key_record = Handle::make_new_rec(&key_values);

            let mut out = Vec::new();
            if db.get_record(&key_record, &mut out)? {
                let decoded = decode_row_as_csv(&out)?;
                println!("{decoded}");
                Ok(())
            } else {
                anyhow::bail!("not found");
            }
        }
        "-t" => {
            println!("self-tests: run `cargo test` for the engine's unit and integration suite");
            Ok(())
        }
        other => anyhow::bail!("unknown flag {other:?}; expected -c, -i, -r, or -t"),
    }
}

fn decode_row_as_csv(record: &[u8]) -> anyhow::Result<String> {
    let mut fields = Vec::new();
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        match Handle::read_col(i, record, &mut out) {
            Ok(_) => fields.push(String::from_utf8_lossy(&out).into_owned()),
            Err(_) => break,
        }
        i += 1;
    }
    Ok(fields.join(","))
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
