#![no_main]

use libfuzzer_sys::fuzz_target;
use petree::PEImage;

fuzz_target!(|data: &[u8]| {
    // Full open including the resource tree, then walk everything it exposes.
    let Ok(image) = PEImage::parse(data) else {
        return;
    };
    let _ = image.validate();
    if let Some(tree) = image.resource_tree() {
        let _ = tree.to_string();
        for leaf in tree.leaves() {
            let _ = image.resource_data(leaf.data);
        }
    }
    for section in image.sections() {
        let _ = image.section_data(section);
    }
});
