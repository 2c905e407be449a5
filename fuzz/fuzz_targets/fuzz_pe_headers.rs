#![no_main]

use libfuzzer_sys::fuzz_target;
use petree::PEHeaders;

fuzz_target!(|data: &[u8]| {
    // Headers and section table only; must return an error rather than panic.
    if let Ok(headers) = PEHeaders::from_slice(data) {
        for section in &headers.sections {
            let _ = headers.rva_to_file_offset(section.virtual_address);
        }
    }
});
